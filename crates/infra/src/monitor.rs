//! Queue health sampling, alerting and periodic trimming.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use pirepsync_core::TenantId;
use pirepsync_queue::{stream_name, QueueStore, CONSUMER_GROUP};

use crate::tenants::{TenantConfigSource, AIRTABLE_PROVIDER};
use crate::workers::ticker;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Too many delivered-but-unacked messages. Takes precedence.
    HighPending,
    HighQueue,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueHealthSnapshot {
    pub tenant_id: TenantId,
    pub stream: String,
    pub queue_length: u64,
    pub pending_count: u64,
    pub status: HealthStatus,
    /// Shared by every snapshot taken in the same pass.
    pub sampled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub check_interval: Duration,
    pub trim_interval: Duration,
    pub trim_max_len: u64,
    pub pending_threshold: u64,
    pub queue_threshold: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            trim_interval: Duration::from_secs(600),
            trim_max_len: 10_000,
            pending_threshold: 1_000,
            queue_threshold: 5_000,
        }
    }
}

impl MonitorSettings {
    /// Pending backlog is checked before total length.
    pub fn classify(&self, queue_length: u64, pending_count: u64) -> HealthStatus {
        if pending_count > self.pending_threshold {
            HealthStatus::HighPending
        } else if queue_length > self.queue_threshold {
            HealthStatus::HighQueue
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Receiver for unhealthy-queue notifications.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, snapshot: &QueueHealthSnapshot);
}

/// Emits one `warn!` line per alert.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, s: &QueueHealthSnapshot) {
        warn!(
            tenant_id = %s.tenant_id,
            stream = %s.stream,
            queue_length = s.queue_length,
            pending_count = s.pending_count,
            status = ?s.status,
            sampled_at = %s.sampled_at,
            "queue health alert"
        );
    }
}

/// Counts alerts and keeps every snapshot it was handed.
#[derive(Debug, Default)]
pub struct CountingAlertSink {
    count: AtomicU64,
    received: Mutex<Vec<QueueHealthSnapshot>>,
}

impl CountingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> Vec<QueueHealthSnapshot> {
        self.received
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for CountingAlertSink {
    async fn alert(&self, snapshot: &QueueHealthSnapshot) {
        self.count.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut v) = self.received.lock() {
            v.push(snapshot.clone());
        }
    }
}

pub struct QueueMonitor {
    queue: Arc<dyn QueueStore>,
    configs: Arc<dyn TenantConfigSource>,
    alerts: Arc<dyn AlertSink>,
    settings: MonitorSettings,
}

/// Handle for the two periodic monitor tasks.
#[derive(Debug)]
pub struct MonitorHandle {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl MonitorHandle {
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "monitor task panicked or was aborted");
            }
        }
    }
}

impl QueueMonitor {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        configs: Arc<dyn TenantConfigSource>,
        alerts: Arc<dyn AlertSink>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            queue,
            configs,
            alerts,
            settings,
        }
    }

    pub fn settings(&self) -> &MonitorSettings {
        &self.settings
    }

    async fn tenants(&self) -> Vec<TenantId> {
        match self.configs.active_tenants(AIRTABLE_PROVIDER).await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "monitor could not list active tenants");
                Vec::new()
            }
        }
    }

    /// Current depth and status of every active tenant's stream.
    ///
    /// Tenants whose stream cannot be read are logged and left out.
    pub async fn snapshot(&self) -> Vec<QueueHealthSnapshot> {
        let sampled_at = Utc::now();
        let mut out = Vec::new();

        for tenant_id in self.tenants().await {
            let stream = stream_name(tenant_id);

            let queue_length = match self.queue.queue_length(&stream).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(%tenant_id, stream = %stream, error = %e, "queue length unavailable");
                    continue;
                }
            };
            let pending_count = match self.queue.pending_count(&stream, CONSUMER_GROUP).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(%tenant_id, stream = %stream, error = %e, "pending count unavailable");
                    continue;
                }
            };

            out.push(QueueHealthSnapshot {
                tenant_id,
                status: self.settings.classify(queue_length, pending_count),
                stream,
                queue_length,
                pending_count,
                sampled_at,
            });
        }

        out
    }

    /// Sample every tenant, alert on unhealthy ones. Returns the alert count.
    pub async fn check_all(&self) -> usize {
        let snapshots = self.snapshot().await;
        let mut alerts = 0;
        let mut total_queued = 0u64;
        let mut total_pending = 0u64;

        for s in &snapshots {
            total_queued += s.queue_length;
            total_pending += s.pending_count;

            info!(
                tenant_id = %s.tenant_id,
                stream = %s.stream,
                queue_length = s.queue_length,
                pending_count = s.pending_count,
                status = ?s.status,
                "queue health"
            );

            if !s.status.is_healthy() {
                self.alerts.alert(s).await;
                alerts += 1;
            }
        }

        info!(
            tenants = snapshots.len(),
            total_queued,
            total_pending,
            alerts,
            "queue health summary"
        );

        alerts
    }

    /// Cap every tenant stream at `max_len`. Returns the total removed.
    pub async fn auto_trim(&self, max_len: u64) -> u64 {
        let mut removed = 0;

        for tenant_id in self.tenants().await {
            let stream = stream_name(tenant_id);
            match self.queue.trim_stream(&stream, max_len).await {
                Ok(0) => {}
                Ok(n) => {
                    info!(%tenant_id, stream = %stream, removed = n, max_len, "trimmed stream");
                    removed += n;
                }
                Err(e) => warn!(%tenant_id, stream = %stream, error = %e, "trim failed"),
            }
        }

        removed
    }

    /// Run the health check and the trim on their own intervals until
    /// `cancel` fires.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> MonitorHandle {
        let mut tasks = JoinSet::new();

        let monitor = self.clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            let period = monitor.settings.check_interval;
            run_every(period, token, || async {
                monitor.check_all().await;
            })
            .await;
            info!("health check task stopped");
        });

        let monitor = self;
        let token = cancel.clone();
        tasks.spawn(async move {
            let period = monitor.settings.trim_interval;
            let max_len = monitor.settings.trim_max_len;
            run_every(period, token, || async {
                monitor.auto_trim(max_len).await;
            })
            .await;
            info!("trim task stopped");
        });

        MonitorHandle { cancel, tasks }
    }
}

async fn run_every<F, Fut>(period: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut ticker = ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => tick().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenants::{InMemoryTenantConfigSource, ProviderConfig};
    use pirepsync_queue::{InMemoryQueueStore, QueueItem};
    use serde_json::json;

    struct Fixture {
        queue: Arc<InMemoryQueueStore>,
        sink: Arc<CountingAlertSink>,
        monitor: QueueMonitor,
        tenant_id: TenantId,
    }

    fn fixture(settings: MonitorSettings) -> Fixture {
        let tenant_id = TenantId::new();
        let configs = Arc::new(InMemoryTenantConfigSource::new());
        configs.upsert(ProviderConfig::new(tenant_id, AIRTABLE_PROVIDER, json!({})));
        let queue = InMemoryQueueStore::arc();
        let sink = Arc::new(CountingAlertSink::new());
        let monitor = QueueMonitor::new(queue.clone(), configs, sink.clone(), settings);
        Fixture {
            queue,
            sink,
            monitor,
            tenant_id,
        }
    }

    async fn fill(queue: &InMemoryQueueStore, tenant_id: TenantId, n: usize) {
        let stream = stream_name(tenant_id);
        queue.ensure_consumer_group(&stream, CONSUMER_GROUP).await.unwrap();
        let items: Vec<_> = (0..n)
            .map(|i| QueueItem::new(tenant_id, format!("rec{i}")))
            .collect();
        queue.enqueue_batch(&stream, &items).await.unwrap();
    }

    async fn deliver(queue: &InMemoryQueueStore, tenant_id: TenantId, n: usize) {
        let stream = stream_name(tenant_id);
        for _ in 0..n {
            queue
                .dequeue(&stream, CONSUMER_GROUP, "c1", Duration::from_millis(1))
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[test]
    fn classification_thresholds() {
        let s = MonitorSettings::default();
        assert_eq!(s.classify(100, 1500), HealthStatus::HighPending);
        assert_eq!(s.classify(6000, 10), HealthStatus::HighQueue);
        assert_eq!(s.classify(6000, 1500), HealthStatus::HighPending);
        assert_eq!(s.classify(5000, 1000), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn high_pending_raises_one_alert() {
        let fx = fixture(MonitorSettings {
            pending_threshold: 3,
            queue_threshold: 50,
            ..Default::default()
        });
        fill(&fx.queue, fx.tenant_id, 10).await;
        deliver(&fx.queue, fx.tenant_id, 5).await;

        assert_eq!(fx.monitor.check_all().await, 1);
        assert_eq!(fx.sink.count(), 1);
        let alert = &fx.sink.received()[0];
        assert_eq!(alert.status, HealthStatus::HighPending);
        assert_eq!(alert.pending_count, 5);
        assert_eq!(alert.queue_length, 10);
    }

    #[tokio::test]
    async fn high_queue_without_pending_backlog() {
        let fx = fixture(MonitorSettings {
            pending_threshold: 3,
            queue_threshold: 5,
            ..Default::default()
        });
        fill(&fx.queue, fx.tenant_id, 8).await;

        let before = Utc::now();
        let snaps = fx.monitor.snapshot().await;
        let after = Utc::now();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].status, HealthStatus::HighQueue);
        assert_eq!(snaps[0].queue_length, 8);
        assert_eq!(snaps[0].pending_count, 0);
        assert!(before <= snaps[0].sampled_at && snaps[0].sampled_at <= after);
        assert_eq!(fx.monitor.check_all().await, 1);
    }

    #[tokio::test]
    async fn healthy_queue_raises_nothing() {
        let fx = fixture(MonitorSettings::default());
        fill(&fx.queue, fx.tenant_id, 3).await;

        assert_eq!(fx.monitor.check_all().await, 0);
        assert_eq!(fx.sink.count(), 0);
    }

    #[tokio::test]
    async fn tenant_without_stream_is_skipped() {
        let fx = fixture(MonitorSettings::default());
        // No group/stream created for the tenant.
        assert!(fx.monitor.snapshot().await.is_empty());
        assert_eq!(fx.monitor.check_all().await, 0);
    }

    #[tokio::test]
    async fn auto_trim_caps_every_stream() {
        let fx = fixture(MonitorSettings::default());
        fill(&fx.queue, fx.tenant_id, 500).await;

        let removed = fx.monitor.auto_trim(100).await;
        assert_eq!(removed, 400);
        let len = fx
            .queue
            .queue_length(&stream_name(fx.tenant_id))
            .await
            .unwrap();
        assert!(len <= 100);
    }

    #[tokio::test]
    async fn zero_period_still_ticks() {
        let cancel = CancellationToken::new();
        let ticks = AtomicU64::new(0);

        let run = run_every(Duration::ZERO, cancel.clone(), || async {
            if ticks.fetch_add(1, Ordering::Relaxed) >= 2 {
                cancel.cancel();
            }
        });
        tokio::time::timeout(Duration::from_secs(2), run)
            .await
            .expect("ticker never fired");

        assert!(ticks.load(Ordering::Relaxed) >= 3);
    }

    #[tokio::test]
    async fn spawned_tasks_stop_on_cancel() {
        let fx = fixture(MonitorSettings {
            check_interval: Duration::from_millis(10),
            trim_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let handle = Arc::new(fx.monitor).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("monitor tasks did not stop");
    }
}
