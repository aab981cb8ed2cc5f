//! Per-tenant worker pool.

use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pirepsync_core::TenantId;
use pirepsync_queue::{
    claimer_consumer_name, stream_name, worker_consumer_name, QueueError, QueueStore,
    CONSUMER_GROUP,
};

use super::{ack, handle_delivery, DispatcherSettings, Reclaimer, StatsSnapshot, WorkerStats};
use crate::processor::RecordProcessor;
use crate::tenants::{TenantConfigError, TenantConfigSource, AIRTABLE_PROVIDER};

/// Discovers tenants once and runs their consumers until cancelled.
pub struct Dispatcher {
    queue: Arc<dyn QueueStore>,
    configs: Arc<dyn TenantConfigSource>,
    processor: Arc<RecordProcessor>,
    settings: DispatcherSettings,
}

/// Control surface for a started dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
    stats: Arc<WorkerStats>,
    tenants: Vec<TenantId>,
}

impl DispatcherHandle {
    /// Signal every task to stop. Returns immediately; use `join` to wait.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait until every worker and the reclaimer have exited. Returns the
    /// final counters.
    pub async fn join(mut self) -> StatsSnapshot {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "worker task panicked or was aborted");
            }
        }
        self.stats.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Tenants whose consumers were started.
    pub fn tenants(&self) -> &[TenantId] {
        &self.tenants
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        configs: Arc<dyn TenantConfigSource>,
        processor: Arc<RecordProcessor>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            queue,
            configs,
            processor,
            settings,
        }
    }

    /// Start consumers for every active tenant plus the reclaimer.
    ///
    /// Tenants are discovered once; a tenant activated later needs a restart.
    /// A failed discovery read is returned without starting any task.
    pub async fn start(
        self,
        cancel: CancellationToken,
    ) -> Result<DispatcherHandle, TenantConfigError> {
        let stats = Arc::new(WorkerStats::default());
        let mut tasks = JoinSet::new();
        let mut started = Vec::new();

        let tenants = self
            .configs
            .active_tenants(AIRTABLE_PROVIDER)
            .await
            .inspect_err(|e| error!(error = %e, "failed to list active tenants"))?;

        if tenants.is_empty() {
            info!("no active tenants; dispatcher idle");
        }

        for tenant_id in tenants {
            let stream = stream_name(tenant_id);

            if let Err(e) = self.queue.ensure_consumer_group(&stream, CONSUMER_GROUP).await {
                error!(
                    %tenant_id,
                    stream = %stream,
                    error = %e,
                    "cannot ensure consumer group; skipping tenant"
                );
                continue;
            }

            for index in 0..self.settings.workers_per_tenant {
                let worker = Worker {
                    queue: self.queue.clone(),
                    processor: self.processor.clone(),
                    stats: stats.clone(),
                    stream: stream.clone(),
                    consumer: worker_consumer_name(&self.settings.worker_prefix, tenant_id, index),
                    settings: self.settings.clone(),
                };
                tasks.spawn(worker.run(cancel.clone()));
            }

            info!(
                %tenant_id,
                stream = %stream,
                workers = self.settings.workers_per_tenant,
                "started tenant consumers"
            );
            started.push(tenant_id);
        }

        if !started.is_empty() {
            let reclaimer = Reclaimer::new(
                self.queue.clone(),
                self.processor.clone(),
                stats.clone(),
                started.iter().copied().map(stream_name).collect(),
                claimer_consumer_name(&self.settings.worker_prefix),
                self.settings.claim_min_idle,
                self.settings.claim_batch,
            );
            tasks.spawn(reclaimer.run(self.settings.claim_interval, cancel.clone()));
        }

        info!(tenants = started.len(), tasks = tasks.len(), "dispatcher started");

        Ok(DispatcherHandle {
            cancel,
            tasks,
            stats,
            tenants: started,
        })
    }
}

struct Worker {
    queue: Arc<dyn QueueStore>,
    processor: Arc<RecordProcessor>,
    stats: Arc<WorkerStats>,
    stream: String,
    consumer: String,
    settings: DispatcherSettings,
}

impl Worker {
    async fn run(self, cancel: CancellationToken) {
        info!(stream = %self.stream, consumer = %self.consumer, "worker started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                res = self.queue.dequeue(
                    &self.stream,
                    CONSUMER_GROUP,
                    &self.consumer,
                    self.settings.block_timeout,
                ) => res,
            };

            match next {
                Ok(Some(delivery)) => {
                    handle_delivery(
                        self.queue.as_ref(),
                        &self.processor,
                        &self.stats,
                        &self.stream,
                        &self.consumer,
                        &delivery,
                    )
                    .await;
                }
                Ok(None) => {}
                Err(QueueError::Payload { message_id, reason }) => {
                    warn!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        %message_id,
                        reason = %reason,
                        "undecodable message; acking and skipping"
                    );
                    self.stats.record_skipped();
                    ack(self.queue.as_ref(), &self.stream, &self.consumer, &message_id).await;
                }
                Err(e) => {
                    error!(
                        stream = %self.stream,
                        consumer = %self.consumer,
                        error = %e,
                        "dequeue failed; backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.settings.error_backoff) => {}
                    }
                }
            }
        }

        info!(stream = %self.stream, consumer = %self.consumer, "worker stopped");
    }
}
