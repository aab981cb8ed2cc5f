//! Long-running tasks that drain tenant streams.
//!
//! - `dispatcher`: N consumers per tenant plus one stale-message reclaimer
//! - `reclaimer`: periodic `claim_stale` sweep across started tenants
//!
//! Every task is driven by one shared `CancellationToken` and joined through
//! a `JoinSet` owned by the handle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{error, warn};

use pirepsync_queue::{Delivery, QueueStore, CONSUMER_GROUP, DEFAULT_CLAIM_BATCH};

use crate::processor::RecordProcessor;

pub mod dispatcher;
pub mod reclaimer;

pub use dispatcher::{Dispatcher, DispatcherHandle};
pub use reclaimer::Reclaimer;

/// Pause after a transport error before the next read.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Shortest period a periodic task will tick at.
pub const MIN_TICK: Duration = Duration::from_millis(1);

/// Interval whose first tick lands one `period` from now. Periods below
/// `MIN_TICK` are raised to it.
pub(crate) fn ticker(period: Duration) -> Interval {
    let period = period.max(MIN_TICK);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Tunables for the dispatcher and its reclaimer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub worker_prefix: String,
    pub workers_per_tenant: usize,
    pub block_timeout: Duration,
    pub claim_interval: Duration,
    pub claim_min_idle: Duration,
    pub claim_batch: usize,
    pub error_backoff: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            worker_prefix: crate::config::DEFAULT_WORKER_PREFIX.to_string(),
            workers_per_tenant: 2,
            block_timeout: Duration::from_secs(5),
            claim_interval: Duration::from_secs(120),
            claim_min_idle: Duration::from_secs(300),
            claim_batch: DEFAULT_CLAIM_BATCH,
            error_backoff: ERROR_BACKOFF,
        }
    }
}

/// Counters shared by every worker task.
#[derive(Debug, Default)]
pub struct WorkerStats {
    processed: AtomicU64,
    failed: AtomicU64,
    reclaimed: AtomicU64,
    skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub reclaimed: u64,
    /// Undecodable messages acked without processing.
    pub skipped: u64,
}

impl WorkerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_reclaimed(&self, n: u64) {
        self.reclaimed.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process one delivery and ack it whatever the outcome.
///
/// A processing failure is logged and counted; the message is still acked so
/// a poison item never blocks the stream. An ack failure leaves the message
/// pending for the reclaimer.
pub(crate) async fn handle_delivery(
    queue: &dyn QueueStore,
    processor: &RecordProcessor,
    stats: &WorkerStats,
    stream: &str,
    consumer: &str,
    delivery: &Delivery,
) {
    let message_id = &delivery.message_id;

    match processor.process(&delivery.item).await {
        Ok(_) => {
            stats.processed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.failed.fetch_add(1, Ordering::Relaxed);
            error!(
                tenant_id = %delivery.item.va_id,
                record_id = %delivery.item.airtable_record_id,
                stream,
                consumer,
                %message_id,
                error = %e,
                "failed to process pirep; acking anyway"
            );
        }
    }

    ack(queue, stream, consumer, message_id).await;
}

pub(crate) async fn ack(
    queue: &dyn QueueStore,
    stream: &str,
    consumer: &str,
    message_id: &pirepsync_queue::MessageId,
) {
    if let Err(e) = queue.ack(stream, CONSUMER_GROUP, message_id).await {
        warn!(stream, consumer, %message_id, error = %e, "ack failed; message stays pending");
    }
}
