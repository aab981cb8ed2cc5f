//! In-memory queue store for tests/dev.
//!
//! Mirrors the consumer-group semantics of the broker:
//! - group cursor starts at the beginning of the log
//! - `dequeue` hands out entries the group has not seen yet
//! - delivered entries stay pending (with owner + delivery time) until acked
//! - trimming drops log entries but leaves pending bookkeeping in place

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::item::{Delivery, MessageId, PendingEntry, QueueItem};
use crate::store::{QueueError, QueueStore};

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: DateTime<Utc>,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, PendingState>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<u64, String>,
    next_seq: u64,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn append(&mut self, payload: String) -> MessageId {
        self.next_seq += 1;
        self.entries.insert(self.next_seq, payload);
        message_id(self.next_seq)
    }
}

/// In-memory consumer-group queue.
///
/// - No IO
/// - Blocking reads are woken on enqueue
/// - Idle times come from the injected [`Clock`]
#[derive(Debug)]
pub struct InMemoryQueueStore {
    streams: Mutex<HashMap<String, Stream>>,
    notify: Notify,
    clock: Arc<dyn Clock>,
}

impl InMemoryQueueStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            streams: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Append an already-encoded payload as-is, bypassing the item codec.
    pub fn enqueue_raw(&self, stream: &str, payload: impl Into<String>) -> MessageId {
        let id = self
            .lock()
            .entry(stream.to_string())
            .or_default()
            .append(payload.into());
        self.notify.notify_waiters();
        id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        self.streams.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Try to hand one unseen entry to `consumer`.
    fn try_deliver(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Option<(MessageId, String)>, QueueError> {
        let mut streams = self.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let next = s
            .entries
            .range(g.last_delivered + 1..)
            .next()
            .map(|(seq, payload)| (*seq, payload.clone()));

        let Some((seq, payload)) = next else {
            return Ok(None);
        };

        g.last_delivered = seq;
        g.pending.insert(
            seq,
            PendingState {
                consumer: consumer.to_string(),
                delivered_at: self.clock.now(),
                delivery_count: 1,
            },
        );

        Ok(Some((message_id(seq), payload)))
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, stream: &str, item: &QueueItem) -> Result<MessageId, QueueError> {
        let payload = item.to_payload()?;
        let id = self.lock().entry(stream.to_string()).or_default().append(payload);
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn enqueue_batch(
        &self,
        stream: &str,
        items: &[QueueItem],
    ) -> Result<Vec<MessageId>, QueueError> {
        let mut payloads = Vec::with_capacity(items.len());
        for item in items {
            match item.to_payload() {
                Ok(p) => payloads.push(p),
                Err(e) => warn!(
                    stream,
                    record_id = %item.airtable_record_id,
                    error = %e,
                    "skipping unserializable queue item in batch"
                ),
            }
        }

        let ids = {
            let mut streams = self.lock();
            let s = streams.entry(stream.to_string()).or_default();
            payloads.into_iter().map(|p| s.append(p)).collect::<Vec<_>>()
        };
        self.notify.notify_waiters();
        Ok(ids)
    }

    async fn ensure_consumer_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        self.lock()
            .entry(stream.to_string())
            .or_default()
            .groups
            .entry(group.to_string())
            .or_default();
        Ok(())
    }

    async fn dequeue(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block_timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let deadline = tokio::time::Instant::now() + block_timeout;

        loop {
            // Register interest before checking so an enqueue in between is not missed.
            let notified = self.notify.notified();

            if let Some((message_id, payload)) = self.try_deliver(stream, group, consumer)? {
                return match QueueItem::from_payload(&payload) {
                    Ok(item) => Ok(Some(Delivery { message_id, item })),
                    Err(e) => Err(QueueError::Payload {
                        message_id,
                        reason: e.to_string(),
                    }),
                };
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(
        &self,
        stream: &str,
        group: &str,
        message_id: &MessageId,
    ) -> Result<(), QueueError> {
        let Some(seq) = parse_seq(message_id) else {
            return Err(QueueError::Broker(format!("invalid message id {message_id}")));
        };

        let mut streams = self.lock();
        if let Some(g) = streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) {
            g.pending.remove(&seq);
        }
        Ok(())
    }

    async fn queue_length(&self, stream: &str) -> Result<u64, QueueError> {
        Ok(self
            .lock()
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, QueueError> {
        let streams = self.lock();
        let g = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;
        Ok(g.pending.len() as u64)
    }

    async fn pending_entries(
        &self,
        stream: &str,
        group: &str,
        max: usize,
    ) -> Result<Vec<PendingEntry>, QueueError> {
        let now = self.clock.now();
        let streams = self.lock();
        let g = streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(stream, group))?;

        Ok(g.pending
            .iter()
            .take(max)
            .map(|(seq, p)| PendingEntry {
                message_id: message_id(*seq),
                consumer: p.consumer.clone(),
                idle: idle_since(p.delivered_at, now),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        max_batch: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let now = self.clock.now();
        let mut streams = self.lock();
        let s = streams
            .get_mut(stream)
            .ok_or_else(|| no_group(stream, group))?;
        let g = s.groups.get_mut(group).ok_or_else(|| no_group(stream, group))?;

        let stale: Vec<u64> = g
            .pending
            .iter()
            .take(max_batch)
            .filter(|(_, p)| idle_since(p.delivered_at, now) >= min_idle)
            .map(|(seq, _)| *seq)
            .collect();

        let mut claimed = Vec::with_capacity(stale.len());
        for seq in stale {
            let id = message_id(seq);

            let Some(payload) = s.entries.get(&seq) else {
                warn!(stream, message_id = %id, "pending entry was trimmed; acking");
                g.pending.remove(&seq);
                continue;
            };

            let item = match QueueItem::from_payload(payload) {
                Ok(item) => item,
                Err(e) => {
                    warn!(
                        stream,
                        message_id = %id,
                        error = %e,
                        "undecodable pending entry; acking"
                    );
                    g.pending.remove(&seq);
                    continue;
                }
            };

            if let Some(p) = g.pending.get_mut(&seq) {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.delivery_count += 1;
            }

            claimed.push(Delivery {
                message_id: id,
                item,
            });
        }

        Ok(claimed)
    }

    async fn trim_stream(&self, stream: &str, max_len: u64) -> Result<u64, QueueError> {
        let mut streams = self.lock();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(0);
        };

        let mut removed = 0;
        while s.entries.len() as u64 > max_len {
            if s.entries.pop_first().is_none() {
                break;
            }
            removed += 1;
        }
        Ok(removed)
    }
}

fn message_id(seq: u64) -> MessageId {
    MessageId::new(format!("{seq}-0"))
}

fn parse_seq(id: &MessageId) -> Option<u64> {
    id.as_str().split('-').next()?.parse().ok()
}

fn idle_since(delivered_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - delivered_at).to_std().unwrap_or_default()
}

fn no_group(stream: &str, group: &str) -> QueueError {
    QueueError::Broker(format!(
        "NOGROUP no such key '{stream}' or consumer group '{group}'"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use pirepsync_core::TenantId;

    const STREAM: &str = "pirep:sync:test";
    const GROUP: &str = "pirep-processors";
    const SHORT: Duration = Duration::from_millis(20);

    fn item(id: &str) -> QueueItem {
        QueueItem::new(TenantId::new(), id).with_field("Route", "KSEA-KLAX")
    }

    #[tokio::test]
    async fn ensure_consumer_group_is_idempotent() {
        let store = InMemoryQueueStore::new();
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();
        store.enqueue(STREAM, &item("rec1")).await.unwrap();
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();

        // Second call must not reset the cursor or fail.
        let d = store.dequeue(STREAM, GROUP, "c1", SHORT).await.unwrap();
        assert!(d.is_some());
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();
        assert!(store.dequeue(STREAM, GROUP, "c1", SHORT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn dequeue_without_group_is_a_broker_error() {
        let store = InMemoryQueueStore::new();
        let err = store.dequeue(STREAM, GROUP, "c1", SHORT).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn dequeue_round_trips_payload_and_tracks_pending() {
        let store = InMemoryQueueStore::new();
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();

        let sent = item("rec1");
        let id = store.enqueue(STREAM, &sent).await.unwrap();

        let d = store.dequeue(STREAM, GROUP, "c1", SHORT).await.unwrap().unwrap();
        assert_eq!(d.message_id, id);
        assert_eq!(d.item, sent);
        assert_eq!(store.pending_count(STREAM, GROUP).await.unwrap(), 1);

        store.ack(STREAM, GROUP, &d.message_id).await.unwrap();
        assert_eq!(store.pending_count(STREAM, GROUP).await.unwrap(), 0);
        assert_eq!(store.queue_length(STREAM).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dequeue_times_out_empty() {
        let store = InMemoryQueueStore::new();
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();
        let started = tokio::time::Instant::now();
        assert!(store.dequeue(STREAM, GROUP, "c1", SHORT).await.unwrap().is_none());
        assert!(started.elapsed() >= SHORT);
    }

    #[tokio::test]
    async fn blocked_dequeue_wakes_on_enqueue() {
        let store = Arc::new(InMemoryQueueStore::new());
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .dequeue(STREAM, GROUP, "c1", Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.enqueue(STREAM, &item("rec1")).await.unwrap();

        let d = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(d.item.airtable_record_id, "rec1");
    }

    #[tokio::test]
    async fn each_message_goes_to_one_consumer() {
        let store = InMemoryQueueStore::new();
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();
        store.enqueue(STREAM, &item("rec1")).await.unwrap();
        store.enqueue(STREAM, &item("rec2")).await.unwrap();

        let a = store.dequeue(STREAM, GROUP, "c1", SHORT).await.unwrap().unwrap();
        let b = store.dequeue(STREAM, GROUP, "c2", SHORT).await.unwrap().unwrap();
        assert_ne!(a.message_id, b.message_id);
        assert!(store.dequeue(STREAM, GROUP, "c3", SHORT).await.unwrap().is_none());

        let pending = store.pending_entries(STREAM, GROUP, 10).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].consumer, "c1");
        assert_eq!(pending[1].consumer, "c2");
    }

    #[tokio::test]
    async fn claim_stale_selects_only_entries_past_min_idle() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryQueueStore::with_clock(clock.clone());
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();
        for id in ["rec10m", "rec6m", "rec4m", "rec1m"] {
            store.enqueue(STREAM, &item(id)).await.unwrap();
        }

        let minutes = |m: u64| Duration::from_secs(m * 60);

        // Deliver so that idle times at claim time are 10m, 6m, 4m and 1m.
        store.dequeue(STREAM, GROUP, "dead", SHORT).await.unwrap().unwrap();
        clock.advance(minutes(4));
        store.dequeue(STREAM, GROUP, "dead", SHORT).await.unwrap().unwrap();
        clock.advance(minutes(2));
        store.dequeue(STREAM, GROUP, "dead", SHORT).await.unwrap().unwrap();
        clock.advance(minutes(3));
        store.dequeue(STREAM, GROUP, "dead", SHORT).await.unwrap().unwrap();
        clock.advance(minutes(1));

        let claimed = store
            .claim_stale(STREAM, GROUP, "claimer", minutes(5), 100)
            .await
            .unwrap();
        let mut ids: Vec<_> = claimed
            .iter()
            .map(|d| d.item.airtable_record_id.as_str())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["rec10m", "rec6m"]);

        let owners: HashMap<_, _> = store
            .pending_entries(STREAM, GROUP, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|p| (p.message_id, p.consumer))
            .collect();
        assert_eq!(owners.values().filter(|c| *c == "claimer").count(), 2);
        assert_eq!(owners.values().filter(|c| *c == "dead").count(), 2);
    }

    #[tokio::test]
    async fn claim_stale_acks_trimmed_entries() {
        let clock = Arc::new(ManualClock::default());
        let store = InMemoryQueueStore::with_clock(clock.clone());
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();
        store.enqueue(STREAM, &item("rec1")).await.unwrap();
        store.enqueue(STREAM, &item("rec2")).await.unwrap();
        store.dequeue(STREAM, GROUP, "dead", SHORT).await.unwrap().unwrap();

        assert_eq!(store.trim_stream(STREAM, 1).await.unwrap(), 1);
        clock.advance(Duration::from_secs(600));

        let claimed = store
            .claim_stale(STREAM, GROUP, "claimer", Duration::from_secs(300), 100)
            .await
            .unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.pending_count(STREAM, GROUP).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn trim_caps_stream_length() {
        let store = InMemoryQueueStore::new();
        let items: Vec<_> = (0..500).map(|i| item(&format!("rec{i}"))).collect();
        let ids = store.enqueue_batch(STREAM, &items).await.unwrap();
        assert_eq!(ids.len(), 500);

        let removed = store.trim_stream(STREAM, 100).await.unwrap();
        assert_eq!(removed, 400);
        assert!(store.queue_length(STREAM).await.unwrap() <= 100);
    }

    #[tokio::test]
    async fn undecodable_entry_surfaces_with_its_id() {
        let store = InMemoryQueueStore::new();
        store.ensure_consumer_group(STREAM, GROUP).await.unwrap();
        let id = store.enqueue_raw(STREAM, "{broken");

        match store.dequeue(STREAM, GROUP, "c1", SHORT).await {
            Err(QueueError::Payload { message_id, .. }) => assert_eq!(message_id, id),
            other => panic!("expected payload error, got {other:?}"),
        }
        assert_eq!(store.pending_count(STREAM, GROUP).await.unwrap(), 1);
    }
}
