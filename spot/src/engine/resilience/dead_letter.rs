//! Dead-letter queue for poison messages.
//!
//! Tracks per-message failure counts. Once a message fails more than the
//! configured maximum it is diverted into a holding area exactly once; the
//! caller then acknowledges it on the primary stream so it stops blocking
//! consumer-group progress. Entries are consumed only by out-of-band
//! inspection tooling.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::engine::entry::now_millis;

#[derive(Debug, Clone)]
pub struct DeadLetterEntry {
    pub message_id: String,
    pub payload: String,
    pub reason: String,
    pub retry_count: u32,
    pub first_seen: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqVerdict {
    /// Leave the message un-acknowledged for redelivery; carries the failure
    /// count so far.
    Retry(u32),
    /// The message was diverted; acknowledge it on the primary stream.
    DeadLettered,
}

#[derive(Debug)]
struct Attempts {
    count: u32,
    first_seen: u64,
}

#[derive(Debug)]
pub struct DeadLetterQueue {
    max_retries: u32,
    attempts: Mutex<HashMap<String, Attempts>>,
    entries: Mutex<Vec<DeadLetterEntry>>,
    dead: Mutex<HashSet<String>>,
}

impl DeadLetterQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: Mutex::new(HashMap::new()),
            entries: Mutex::new(Vec::new()),
            dead: Mutex::new(HashSet::new()),
        }
    }

    /// Records one processing failure for a message and decides its fate.
    /// Diversion happens at most once per message id; a redelivered
    /// already-dead message yields `DeadLettered` again without a second
    /// entry.
    pub fn record_failure(&self, message_id: &str, payload: &str, reason: &str) -> DlqVerdict {
        if self.dead.lock().unwrap().contains(message_id) {
            return DlqVerdict::DeadLettered;
        }

        let mut attempts = self.attempts.lock().unwrap();
        let entry = attempts.entry(message_id.to_string()).or_insert(Attempts {
            count: 0,
            first_seen: now_millis(),
        });
        entry.count += 1;

        if entry.count <= self.max_retries {
            return DlqVerdict::Retry(entry.count);
        }

        let record = DeadLetterEntry {
            message_id: message_id.to_string(),
            payload: payload.to_string(),
            reason: reason.to_string(),
            retry_count: entry.count,
            first_seen: entry.first_seen,
        };
        attempts.remove(message_id);
        drop(attempts);

        log::warn!(
            "dead-lettering message {} after {} failures: {}",
            message_id,
            record.retry_count,
            reason
        );
        self.dead.lock().unwrap().insert(message_id.to_string());
        self.entries.lock().unwrap().push(record);
        crate::metrics::DEAD_LETTERED.inc();
        DlqVerdict::DeadLettered
    }

    /// Clears the failure count once a message finally processes.
    pub fn mark_processed(&self, message_id: &str) {
        self.attempts.lock().unwrap().remove(message_id);
    }

    pub fn entries(&self) -> Vec<DeadLetterEntry> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_until_bound_then_divert() {
        let dlq = DeadLetterQueue::new(2);
        assert_eq!(
            dlq.record_failure("m1", "{}", "db down"),
            DlqVerdict::Retry(1)
        );
        assert_eq!(
            dlq.record_failure("m1", "{}", "db down"),
            DlqVerdict::Retry(2)
        );
        assert_eq!(
            dlq.record_failure("m1", "{}", "db down"),
            DlqVerdict::DeadLettered
        );

        let entries = dlq.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message_id, "m1");
        assert_eq!(entries[0].retry_count, 3);
    }

    #[test]
    fn test_diversion_happens_exactly_once() {
        let dlq = DeadLetterQueue::new(0);
        assert_eq!(dlq.record_failure("m1", "{}", "bad"), DlqVerdict::DeadLettered);
        // A duplicate redelivery is reported dead again but not re-recorded.
        assert_eq!(dlq.record_failure("m1", "{}", "bad"), DlqVerdict::DeadLettered);
        assert_eq!(dlq.len(), 1);
    }

    #[test]
    fn test_success_resets_counter() {
        let dlq = DeadLetterQueue::new(1);
        assert_eq!(dlq.record_failure("m1", "{}", "x"), DlqVerdict::Retry(1));
        dlq.mark_processed("m1");
        assert_eq!(dlq.record_failure("m1", "{}", "x"), DlqVerdict::Retry(1));
    }

    #[test]
    fn test_messages_tracked_independently() {
        let dlq = DeadLetterQueue::new(1);
        assert_eq!(dlq.record_failure("a", "{}", "x"), DlqVerdict::Retry(1));
        assert_eq!(dlq.record_failure("b", "{}", "x"), DlqVerdict::Retry(1));
        assert_eq!(dlq.record_failure("a", "{}", "x"), DlqVerdict::DeadLettered);
        assert!(dlq.entries().iter().all(|e| e.message_id == "a"));
    }
}
