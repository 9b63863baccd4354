//! In-memory stream with consumer groups.
//!
//! A retained append log per stream key, a read cursor per group, and a
//! pending map tracking un-acknowledged deliveries with their delivery
//! instant for idle-based reclaim. Blocking reads park on a `Notify` that
//! `append` fires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{IntentStream, PendingInfo, StreamDelivery, StreamError};

#[derive(Debug)]
struct PendingDelivery {
    consumer: String,
    delivered_at: Instant,
    /// Position in the retained log, for redelivery on claim.
    index: usize,
}

#[derive(Debug, Default)]
struct Group {
    cursor: usize,
    pending: HashMap<String, PendingDelivery>,
}

#[derive(Debug, Default)]
struct StreamLog {
    entries: Vec<(String, String)>,
    groups: HashMap<String, Group>,
}

#[derive(Debug, Default)]
pub struct MemoryStream {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_read(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
    ) -> Result<Vec<StreamDelivery>, StreamError> {
        let mut streams = self.streams.lock().unwrap();
        let log = streams.entry(stream_key.to_string()).or_default();
        let group_state = log
            .groups
            .get_mut(group)
            .ok_or_else(|| StreamError::UnknownGroup(stream_key.to_string(), group.to_string()))?;

        let mut batch = Vec::new();
        while batch.len() < batch_size && group_state.cursor < log.entries.len() {
            let index = group_state.cursor;
            group_state.cursor += 1;
            let (message_id, payload) = log.entries[index].clone();
            group_state.pending.insert(
                message_id.clone(),
                PendingDelivery {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                    index,
                },
            );
            batch.push(StreamDelivery {
                message_id,
                payload,
            });
        }
        Ok(batch)
    }
}

#[async_trait]
impl IntentStream for MemoryStream {
    async fn create_consumer_group(
        &self,
        stream_key: &str,
        group: &str,
    ) -> Result<(), StreamError> {
        let mut streams = self.streams.lock().unwrap();
        let log = streams.entry(stream_key.to_string()).or_default();
        // Already-exists is not an error.
        log.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_millis: u64,
    ) -> Result<Vec<StreamDelivery>, StreamError> {
        let deadline = Instant::now() + Duration::from_millis(block_millis);
        loop {
            let batch = self.try_read(stream_key, group, consumer, batch_size)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::select! {
                _ = self.appended.notified() => {}
                _ = tokio::time::sleep(deadline - now) => return Ok(Vec::new()),
            }
        }
    }

    async fn acknowledge(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &str,
    ) -> Result<(), StreamError> {
        let mut streams = self.streams.lock().unwrap();
        if let Some(log) = streams.get_mut(stream_key) {
            if let Some(group_state) = log.groups.get_mut(group) {
                group_state.pending.remove(message_id);
            }
        }
        Ok(())
    }

    async fn list_pending(
        &self,
        stream_key: &str,
        group: &str,
    ) -> Result<Vec<PendingInfo>, StreamError> {
        let streams = self.streams.lock().unwrap();
        let log = match streams.get(stream_key) {
            Some(log) => log,
            None => return Ok(Vec::new()),
        };
        let group_state = log
            .groups
            .get(group)
            .ok_or_else(|| StreamError::UnknownGroup(stream_key.to_string(), group.to_string()))?;
        Ok(group_state
            .pending
            .iter()
            .map(|(message_id, p)| PendingInfo {
                message_id: message_id.clone(),
                consumer: p.consumer.clone(),
                idle_millis: p.delivered_at.elapsed().as_millis() as u64,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        min_idle_millis: u64,
        message_id: &str,
    ) -> Result<Option<StreamDelivery>, StreamError> {
        let mut streams = self.streams.lock().unwrap();
        let log = match streams.get_mut(stream_key) {
            Some(log) => log,
            None => return Ok(None),
        };
        let entries = &log.entries;
        let group_state = log
            .groups
            .get_mut(group)
            .ok_or_else(|| StreamError::UnknownGroup(stream_key.to_string(), group.to_string()))?;

        let pending = match group_state.pending.get_mut(message_id) {
            Some(p) => p,
            None => return Ok(None),
        };
        if (pending.delivered_at.elapsed().as_millis() as u64) < min_idle_millis {
            return Ok(None);
        }
        pending.consumer = consumer.to_string();
        pending.delivered_at = Instant::now();
        let (message_id, payload) = entries[pending.index].clone();
        Ok(Some(StreamDelivery {
            message_id,
            payload,
        }))
    }

    async fn append(&self, stream_key: &str, payload: &str) -> Result<String, StreamError> {
        let mut streams = self.streams.lock().unwrap();
        let log = streams.entry(stream_key.to_string()).or_default();
        let message_id = format!("{}-0", log.entries.len() + 1);
        log.entries
            .push((message_id.clone(), payload.to_string()));
        drop(streams);
        self.appended.notify_waiters();
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "orders:BTC/USDT";
    const GROUP: &str = "matchers";

    #[tokio::test]
    async fn test_group_create_is_idempotent() {
        let stream = MemoryStream::new();
        stream.create_consumer_group(KEY, GROUP).await.unwrap();
        stream.create_consumer_group(KEY, GROUP).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_requires_group() {
        let stream = MemoryStream::new();
        stream.append(KEY, "{}").await.unwrap();
        assert!(matches!(
            stream.read_group(KEY, GROUP, "c1", 10, 0).await,
            Err(StreamError::UnknownGroup(_, _))
        ));
    }

    #[tokio::test]
    async fn test_read_ack_cycle() {
        let stream = MemoryStream::new();
        stream.create_consumer_group(KEY, GROUP).await.unwrap();
        stream.append(KEY, "a").await.unwrap();
        stream.append(KEY, "b").await.unwrap();

        let batch = stream.read_group(KEY, GROUP, "c1", 10, 0).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(stream.list_pending(KEY, GROUP).await.unwrap().len(), 2);

        stream
            .acknowledge(KEY, GROUP, &batch[0].message_id)
            .await
            .unwrap();
        assert_eq!(stream.list_pending(KEY, GROUP).await.unwrap().len(), 1);

        // Delivered messages are not redelivered to the group.
        let again = stream.read_group(KEY, GROUP, "c2", 10, 0).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_batch_size_bounds_read() {
        let stream = MemoryStream::new();
        stream.create_consumer_group(KEY, GROUP).await.unwrap();
        for i in 0..5 {
            stream.append(KEY, &format!("m{}", i)).await.unwrap();
        }
        let batch = stream.read_group(KEY, GROUP, "c1", 2, 0).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn test_blocking_read_times_out_empty() {
        let stream = MemoryStream::new();
        stream.create_consumer_group(KEY, GROUP).await.unwrap();
        let started = Instant::now();
        let batch = stream.read_group(KEY, GROUP, "c1", 10, 30).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[tokio::test]
    async fn test_claim_respects_idle_threshold() {
        let stream = MemoryStream::new();
        stream.create_consumer_group(KEY, GROUP).await.unwrap();
        stream.append(KEY, "payload").await.unwrap();

        // First consumer reads but never acknowledges.
        let batch = stream.read_group(KEY, GROUP, "c1", 1, 0).await.unwrap();
        let message_id = batch[0].message_id.clone();

        // Not idle long enough yet.
        let early = stream
            .claim(KEY, GROUP, "c2", 60_000, &message_id)
            .await
            .unwrap();
        assert!(early.is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let claimed = stream
            .claim(KEY, GROUP, "c2", 10, &message_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.payload, "payload");

        let pending = stream.list_pending(KEY, GROUP).await.unwrap();
        assert_eq!(pending[0].consumer, "c2");

        stream.acknowledge(KEY, GROUP, &message_id).await.unwrap();
        assert!(stream.list_pending(KEY, GROUP).await.unwrap().is_empty());
    }
}
