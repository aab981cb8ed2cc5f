//! Queue store contract.
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: a delivered message stays in the group's pending list
//!   until acked; if its consumer dies it can be reclaimed once idle long enough.
//! - **Single owner**: within a group a pending message belongs to exactly one
//!   consumer at a time.
//! - **No ordering across tenants**: each tenant has its own stream.
//!
//! Consumers must be idempotent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::item::{Delivery, MessageId, PendingEntry, QueueItem};

/// Upper bound on entries inspected per stale-claim pass.
pub const DEFAULT_CLAIM_BATCH: usize = 100;

#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Broker(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A delivered message could not be decoded. It is still pending and
    /// should be acked by the receiver.
    #[error("undecodable payload in message {message_id}: {reason}")]
    Payload {
        message_id: MessageId,
        reason: String,
    },
}

impl QueueError {
    /// Transport-level failures worth retrying on the next loop iteration.
    pub fn is_transient(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Broker(_))
    }
}

/// Durable log primitives over one stream per tenant.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append one item; returns the broker-assigned ID.
    async fn enqueue(&self, stream: &str, item: &QueueItem) -> Result<MessageId, QueueError>;

    /// Append many items in one round trip.
    ///
    /// Items that fail to serialize are logged and skipped; the rest are still
    /// appended. Returns the IDs of the appended items in input order.
    async fn enqueue_batch(
        &self,
        stream: &str,
        items: &[QueueItem],
    ) -> Result<Vec<MessageId>, QueueError>;

    /// Create stream + group if absent, reading from the start of the log.
    /// Idempotent.
    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), QueueError>;

    /// Wait up to `block_timeout` for one message not yet delivered to the group.
    async fn dequeue(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, stream: &str, group: &str, message_id: &MessageId)
        -> Result<(), QueueError>;

    async fn queue_length(&self, stream: &str) -> Result<u64, QueueError>;

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, QueueError>;

    /// Oldest `max` pending entries with owner and idle time.
    async fn pending_entries(
        &self,
        stream: &str,
        group: &str,
        max: usize,
    ) -> Result<Vec<PendingEntry>, QueueError>;

    /// Reassign pending entries idle for at least `min_idle` to `consumer`.
    ///
    /// At most `max_batch` pending entries are inspected. Entries whose payload
    /// is gone (trimmed) or undecodable are acked and not returned.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_batch: usize,
    ) -> Result<Vec<Delivery>, QueueError>;

    /// Cap the stream at `max_len` entries; returns how many were removed.
    ///
    /// Best effort: pending entries can be trimmed as well.
    async fn trim_stream(&self, stream: &str, max_len: u64) -> Result<u64, QueueError>;
}

#[async_trait]
impl<S> QueueStore for Arc<S>
where
    S: QueueStore + ?Sized,
{
    async fn enqueue(&self, stream: &str, item: &QueueItem) -> Result<MessageId, QueueError> {
        (**self).enqueue(stream, item).await
    }

    async fn enqueue_batch(
        &self,
        stream: &str,
        items: &[QueueItem],
    ) -> Result<Vec<MessageId>, QueueError> {
        (**self).enqueue_batch(stream, items).await
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        (**self).ensure_consumer_group(stream, group).await
    }

    async fn dequeue(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        (**self).dequeue(stream, group, consumer, block_timeout).await
    }

    async fn ack(
        &self,
        stream: &str,
        group: &str,
        message_id: &MessageId,
    ) -> Result<(), QueueError> {
        (**self).ack(stream, group, message_id).await
    }

    async fn queue_length(&self, stream: &str) -> Result<u64, QueueError> {
        (**self).queue_length(stream).await
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, QueueError> {
        (**self).pending_count(stream, group).await
    }

    async fn pending_entries(
        &self,
        stream: &str,
        group: &str,
        max: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        (**self).pending_entries(stream, group, max).await
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_batch: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        (**self)
            .claim_stale(stream, group, consumer, min_idle, max_batch)
            .await
    }

    async fn trim_stream(&self, stream: &str, max_len: u64) -> Result<u64, QueueError> {
        (**self).trim_stream(stream, max_len).await
    }
}
