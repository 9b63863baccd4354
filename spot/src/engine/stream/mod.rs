//! Message-stream collaborator.
//!
//! Consumer-group semantics over per-instrument order streams: a delivered
//! message stays pending on its consumer until acknowledged, and a stalled
//! consumer's pending messages can be reclaimed by another consumer once
//! their idle time passes a threshold. Payloads travel as opaque JSON
//! strings; the engine owns parsing so that poison payloads can be
//! dead-lettered rather than wedging the reader.

pub mod memory;

pub use memory::MemoryStream;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream unavailable: {0}")]
    Unavailable(String),
    #[error("unknown consumer group '{1}' on stream '{0}'")]
    UnknownGroup(String, String),
}

/// A message handed to a consumer; stays pending until acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDelivery {
    pub message_id: String,
    pub payload: String,
}

/// A not-yet-acknowledged delivery, as seen by `list_pending`.
#[derive(Debug, Clone)]
pub struct PendingInfo {
    pub message_id: String,
    pub consumer: String,
    pub idle_millis: u64,
}

#[async_trait]
pub trait IntentStream: Send + Sync {
    /// Idempotent: creating a group that already exists is not an error.
    async fn create_consumer_group(&self, stream_key: &str, group: &str)
        -> Result<(), StreamError>;

    /// Blocking batch read for one consumer. Blocks up to `block_millis`
    /// waiting for new messages, returning an empty batch on timeout.
    async fn read_group(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        batch_size: usize,
        block_millis: u64,
    ) -> Result<Vec<StreamDelivery>, StreamError>;

    /// Idempotent acknowledgement; unknown message ids are ignored.
    async fn acknowledge(
        &self,
        stream_key: &str,
        group: &str,
        message_id: &str,
    ) -> Result<(), StreamError>;

    async fn list_pending(
        &self,
        stream_key: &str,
        group: &str,
    ) -> Result<Vec<PendingInfo>, StreamError>;

    /// Reassigns a pending message to `consumer` if it has been idle for at
    /// least `min_idle_millis`; returns the delivery on success.
    async fn claim(
        &self,
        stream_key: &str,
        group: &str,
        consumer: &str,
        min_idle_millis: u64,
        message_id: &str,
    ) -> Result<Option<StreamDelivery>, StreamError>;

    /// Producer side: appends a payload and returns its message id.
    async fn append(&self, stream_key: &str, payload: &str) -> Result<String, StreamError>;
}
