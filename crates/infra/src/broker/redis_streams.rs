//! Redis Streams-backed queue store (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams to provide:
//! - **Durable delivery**: entries persist until acknowledged (or trimmed)
//! - **Consumer groups**: one fixed group per tenant stream
//! - **Stale reclamation**: idle pending entries are moved with `XCLAIM`
//!
//! ## Architecture
//!
//! - **Stream Key**: `pirep:sync:{tenant_id}` (one stream per tenant)
//! - **Consumer Group**: `pirep-processors`
//! - **Consumers**: `{prefix}-va-{tenant}-worker-{n}` and `{prefix}-claimer`
//! - **Entry Fields**: a single `data` field holding the JSON queue item

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamPendingReply,
    StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisError};
use tracing::{debug, instrument, warn};

use pirepsync_queue::{
    Delivery, MessageId, PendingEntry, QueueError, QueueItem, QueueStore, PAYLOAD_FIELD,
};

/// Idle blocking connections kept for reuse.
const MAX_IDLE_BLOCKING_CONNECTIONS: usize = 32;

/// Redis Streams queue store.
///
/// Non-blocking commands share one auto-reconnecting `ConnectionManager`.
/// `XREADGROUP ... BLOCK` gets a dedicated connection from a small pool:
/// Redis serves one connection's commands in order, so a blocked read would
/// otherwise stall every command multiplexed behind it.
pub struct RedisQueueStore {
    client: redis::Client,
    conn: ConnectionManager,
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl core::fmt::Debug for RedisQueueStore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisQueueStore")
            .field("conn", &"ConnectionManager")
            .finish()
    }
}

impl RedisQueueStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, QueueError> {
        let pooled = self
            .blocking
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop();
        match pooled {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_multiplexed_tokio_connection()
                .await
                .map_err(|e| QueueError::Connection(e.to_string())),
        }
    }

    fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut pool = self.blocking.lock().unwrap_or_else(|p| p.into_inner());
        if pool.len() < MAX_IDLE_BLOCKING_CONNECTIONS {
            pool.push(conn);
        }
    }
}

fn broker(context: &str, e: RedisError) -> QueueError {
    if e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        QueueError::Connection(format!("{context}: {e}"))
    } else {
        QueueError::Broker(format!("{context}: {e}"))
    }
}

/// Decode a stream entry into a delivery.
fn decode_entry(entry: &StreamId) -> Result<Delivery, QueueError> {
    let message_id = MessageId::new(entry.id.clone());

    let Some(payload) = entry.get::<String>(PAYLOAD_FIELD) else {
        return Err(QueueError::Payload {
            message_id,
            reason: format!("missing '{PAYLOAD_FIELD}' field"),
        });
    };

    match QueueItem::from_payload(&payload) {
        Ok(item) => Ok(Delivery { message_id, item }),
        Err(e) => Err(QueueError::Payload {
            message_id,
            reason: e.to_string(),
        }),
    }
}

#[async_trait]
impl QueueStore for RedisQueueStore {
    #[instrument(skip(self, item), fields(record_id = %item.airtable_record_id), err)]
    async fn enqueue(&self, stream: &str, item: &QueueItem) -> Result<MessageId, QueueError> {
        let payload = item.to_payload()?;
        let mut conn = self.conn();

        let id: String = conn
            .xadd(stream, "*", &[(PAYLOAD_FIELD, payload)])
            .await
            .map_err(|e| broker("XADD failed", e))?;

        Ok(MessageId::new(id))
    }

    async fn enqueue_batch(
        &self,
        stream: &str,
        items: &[QueueItem],
    ) -> Result<Vec<MessageId>, QueueError> {
        let mut pipe = redis::pipe();
        let mut queued = 0usize;

        for item in items {
            match item.to_payload() {
                Ok(payload) => {
                    pipe.xadd(stream, "*", &[(PAYLOAD_FIELD, payload)]);
                    queued += 1;
                }
                Err(e) => warn!(
                    stream,
                    record_id = %item.airtable_record_id,
                    error = %e,
                    "skipping unserializable queue item in batch"
                ),
            }
        }

        if queued == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn();
        let ids: Vec<String> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| broker("pipelined XADD failed", e))?;

        debug!(stream, count = ids.len(), "batch enqueued");
        Ok(ids.into_iter().map(MessageId::new).collect())
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        let mut conn = self.conn();

        // MKSTREAM creates the stream if needed; "0" reads from the beginning.
        let created: Result<(), RedisError> = conn.xgroup_create_mkstream(stream, group, "0").await;

        match created {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(broker("XGROUP CREATE failed", e)),
        }
    }

    async fn dequeue(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        // BLOCK 0 means "forever"; never send it.
        let block_ms = block_timeout.as_millis().clamp(1, usize::MAX as u128) as usize;
        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .count(1)
            .block(block_ms);

        let mut conn = self.checkout_blocking().await?;
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &opts)
            .await
            .map_err(|e| broker("XREADGROUP failed", e))?;
        self.checkin_blocking(conn);

        let Some(reply) = reply else {
            return Ok(None);
        };

        match reply.keys.iter().flat_map(|k| k.ids.iter()).next() {
            Some(entry) => decode_entry(entry).map(Some),
            None => Ok(None),
        }
    }

    async fn ack(
        &self,
        stream: &str,
        group: &str,
        message_id: &MessageId,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn();
        let _: u64 = conn
            .xack(stream, group, &[message_id.as_str()])
            .await
            .map_err(|e| broker("XACK failed", e))?;
        Ok(())
    }

    async fn queue_length(&self, stream: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        conn.xlen(stream)
            .await
            .map_err(|e| broker("XLEN failed", e))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        let reply: StreamPendingReply = conn
            .xpending(stream, group)
            .await
            .map_err(|e| broker("XPENDING failed", e))?;
        Ok(reply.count() as u64)
    }

    async fn pending_entries(
        &self,
        stream: &str,
        group: &str,
        max: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        let mut conn = self.conn();
        let reply: StreamPendingCountReply = conn
            .xpending_count(stream, group, "-", "+", max)
            .await
            .map_err(|e| broker("XPENDING (extended) failed", e))?;

        Ok(reply
            .ids
            .into_iter()
            .map(|p| PendingEntry {
                message_id: MessageId::new(p.id),
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect())
    }

    #[instrument(skip(self), fields(min_idle_ms = min_idle.as_millis() as u64), err)]
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_batch: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let stale: Vec<String> = self
            .pending_entries(stream, group, max_batch)
            .await?
            .into_iter()
            .filter(|p| p.idle >= min_idle)
            .map(|p| p.message_id.as_str().to_string())
            .collect();

        if stale.is_empty() {
            return Ok(Vec::new());
        }

        // XCLAIM re-checks min idle server-side, so an entry another claimer
        // grabbed in the meantime is left alone.
        let mut conn = self.conn();
        let reply: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle.as_millis() as u64, &stale[..])
            .await
            .map_err(|e| broker("XCLAIM failed", e))?;

        let mut claimed = Vec::with_capacity(reply.ids.len());
        for entry in &reply.ids {
            match decode_entry(entry) {
                Ok(delivery) => claimed.push(delivery),
                Err(e) => {
                    warn!(
                        stream,
                        message_id = %entry.id,
                        error = %e,
                        "dropping unreadable claimed entry"
                    );
                    self.ack(stream, group, &MessageId::new(entry.id.clone())).await?;
                }
            }
        }

        Ok(claimed)
    }

    async fn trim_stream(&self, stream: &str, max_len: u64) -> Result<u64, QueueError> {
        let mut conn = self.conn();
        conn.xtrim(stream, StreamMaxlen::Equals(max_len as usize))
            .await
            .map_err(|e| broker("XTRIM failed", e))
    }
}

/// These run against a live Redis and are skipped unless `REDIS_URL` is set.
#[cfg(test)]
mod tests {
    use super::*;
    use pirepsync_core::TenantId;
    use pirepsync_queue::{stream_name, CONSUMER_GROUP};

    async fn store() -> Option<RedisQueueStore> {
        let url = std::env::var("REDIS_URL").ok()?;
        match RedisQueueStore::connect(url).await {
            Ok(s) => Some(s),
            Err(e) => {
                eprintln!("skipping redis test: {e}");
                None
            }
        }
    }

    async fn cleanup(store: &RedisQueueStore, stream: &str) {
        let mut conn = store.conn();
        let _: Result<(), _> = conn.del(stream).await;
    }

    #[tokio::test]
    async fn ensure_consumer_group_twice_is_ok() {
        let Some(store) = store().await else { return };
        let stream = stream_name(TenantId::new());

        store.ensure_consumer_group(&stream, CONSUMER_GROUP).await.unwrap();
        store.ensure_consumer_group(&stream, CONSUMER_GROUP).await.unwrap();

        cleanup(&store, &stream).await;
    }

    #[tokio::test]
    async fn enqueue_dequeue_ack_round_trip() {
        let Some(store) = store().await else { return };
        let tenant = TenantId::new();
        let stream = stream_name(tenant);
        store.ensure_consumer_group(&stream, CONSUMER_GROUP).await.unwrap();

        let item = QueueItem::new(tenant, "rec1")
            .with_field("Route", "KSEA-KLAX")
            .with_field("FlightTime", 125.5);
        let id = store.enqueue(&stream, &item).await.unwrap();

        let d = store
            .dequeue(&stream, CONSUMER_GROUP, "t-worker-0", Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.message_id, id);
        assert_eq!(d.item, item);
        assert_eq!(store.pending_count(&stream, CONSUMER_GROUP).await.unwrap(), 1);

        store.ack(&stream, CONSUMER_GROUP, &d.message_id).await.unwrap();
        assert_eq!(store.pending_count(&stream, CONSUMER_GROUP).await.unwrap(), 0);

        assert!(store
            .dequeue(&stream, CONSUMER_GROUP, "t-worker-0", Duration::from_millis(50))
            .await
            .unwrap()
            .is_none());

        cleanup(&store, &stream).await;
    }

    #[tokio::test]
    async fn claim_stale_moves_idle_entries() {
        let Some(store) = store().await else { return };
        let tenant = TenantId::new();
        let stream = stream_name(tenant);
        store.ensure_consumer_group(&stream, CONSUMER_GROUP).await.unwrap();
        store.enqueue(&stream, &QueueItem::new(tenant, "rec1")).await.unwrap();

        store
            .dequeue(&stream, CONSUMER_GROUP, "dead", Duration::from_millis(100))
            .await
            .unwrap()
            .unwrap();

        let none = store
            .claim_stale(&stream, CONSUMER_GROUP, "claimer", Duration::from_secs(60), 100)
            .await
            .unwrap();
        assert!(none.is_empty());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let claimed = store
            .claim_stale(&stream, CONSUMER_GROUP, "claimer", Duration::from_millis(50), 100)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);

        let pending = store.pending_entries(&stream, CONSUMER_GROUP, 10).await.unwrap();
        assert_eq!(pending[0].consumer, "claimer");

        cleanup(&store, &stream).await;
    }

    #[tokio::test]
    async fn trim_caps_length() {
        let Some(store) = store().await else { return };
        let tenant = TenantId::new();
        let stream = stream_name(tenant);

        let items: Vec<_> = (0..500)
            .map(|i| QueueItem::new(tenant, format!("rec{i}")))
            .collect();
        store.enqueue_batch(&stream, &items).await.unwrap();

        store.trim_stream(&stream, 100).await.unwrap();
        assert!(store.queue_length(&stream).await.unwrap() <= 100);

        cleanup(&store, &stream).await;
    }
}
