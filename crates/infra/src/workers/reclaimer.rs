//! Stale pending-entry sweep.
//!
//! A consumer that crashes between read and ack leaves its message pending.
//! Once idle past `min_idle`, the reclaimer takes ownership, processes the
//! item, and acks it.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use pirepsync_queue::{QueueStore, CONSUMER_GROUP};

use super::{handle_delivery, ticker, WorkerStats};
use crate::processor::RecordProcessor;

pub struct Reclaimer {
    queue: Arc<dyn QueueStore>,
    processor: Arc<RecordProcessor>,
    stats: Arc<WorkerStats>,
    streams: Vec<String>,
    consumer: String,
    min_idle: Duration,
    batch: usize,
}

impl Reclaimer {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        processor: Arc<RecordProcessor>,
        stats: Arc<WorkerStats>,
        streams: Vec<String>,
        consumer: String,
        min_idle: Duration,
        batch: usize,
    ) -> Self {
        Self {
            queue,
            processor,
            stats,
            streams,
            consumer,
            min_idle,
            batch,
        }
    }

    /// One sweep over every stream. Returns how many messages were reclaimed.
    pub async fn reclaim_once(&self) -> usize {
        let mut total = 0;

        for stream in &self.streams {
            let claimed = match self
                .queue
                .claim_stale(stream, CONSUMER_GROUP, &self.consumer, self.min_idle, self.batch)
                .await
            {
                Ok(c) => c,
                Err(e) => {
                    error!(
                        stream = %stream,
                        consumer = %self.consumer,
                        error = %e,
                        "claim_stale failed"
                    );
                    continue;
                }
            };

            if claimed.is_empty() {
                continue;
            }

            info!(
                stream = %stream,
                consumer = %self.consumer,
                count = claimed.len(),
                "reclaimed stale messages"
            );
            self.stats.record_reclaimed(claimed.len() as u64);

            for delivery in &claimed {
                handle_delivery(
                    self.queue.as_ref(),
                    &self.processor,
                    &self.stats,
                    stream,
                    &self.consumer,
                    delivery,
                )
                .await;
            }
            total += claimed.len();
        }

        total
    }

    /// Sweep every `period` until cancelled. The first sweep runs one period
    /// after start.
    pub async fn run(self, period: Duration, cancel: CancellationToken) {
        let mut ticker = ticker(period);

        info!(consumer = %self.consumer, streams = self.streams.len(), "reclaimer started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.reclaim_once().await;
                }
            }
        }

        info!(consumer = %self.consumer, "reclaimer stopped");
    }
}
