//! Wiring: build every collaborator once, start the tasks, stop them together.

use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

use pirepsync_infra::broker::RedisQueueStore;
use pirepsync_infra::cache::{CacheProvider, RedisCache};
use pirepsync_infra::records::{PostgresRecordStore, RecordStore};
use pirepsync_infra::tenants::{PostgresTenantConfigSource, TenantConfigSource};
use pirepsync_infra::{
    AlertSink, CacheBackend, Dispatcher, DispatcherHandle, LogAlertSink, MonitorHandle,
    QueueMonitor, RecordProcessor, StatsSnapshot, WorkerConfig,
};
use pirepsync_queue::QueueStore;

const CACHE_KEY_PREFIX: &str = "pirepsync:";
const MAX_DB_CONNECTIONS: u32 = 10;

/// Long-lived collaborators shared by every task.
pub struct Services {
    pub queue: Arc<dyn QueueStore>,
    pub configs: Arc<dyn TenantConfigSource>,
    pub processor: Arc<RecordProcessor>,
    pub alerts: Arc<dyn AlertSink>,
    pub cache: CacheProvider,
}

impl Services {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        configs: Arc<dyn TenantConfigSource>,
        records: Arc<dyn RecordStore>,
        cache: CacheProvider,
        config: &WorkerConfig,
    ) -> Self {
        let processor = Arc::new(
            RecordProcessor::new(configs.clone(), records, cache.clone())
                .with_schema_ttl(config.schema_cache_ttl),
        );

        Self {
            queue,
            configs,
            processor,
            alerts: Arc::new(LogAlertSink),
            cache,
        }
    }
}

/// Connect to Redis and Postgres and build the production services.
pub async fn build_services(config: &WorkerConfig) -> anyhow::Result<Services> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set")?;

    let queue = RedisQueueStore::connect(&config.redis_url)
        .await
        .context("failed to connect to Redis")?;

    let pool = PgPoolOptions::new()
        .max_connections(MAX_DB_CONNECTIONS)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")?;

    let cache = match config.cache_backend {
        CacheBackend::Memory => CacheProvider::memory(),
        CacheBackend::Redis => CacheProvider::Redis(Box::new(
            RedisCache::connect(&config.redis_url, CACHE_KEY_PREFIX)
                .await
                .context("failed to connect schema cache")?,
        )),
    };
    tracing::info!(cache = cache.provider_name(), "schema cache ready");

    Ok(Services::new(
        Arc::new(queue),
        Arc::new(PostgresTenantConfigSource::new(pool.clone())),
        Arc::new(PostgresRecordStore::new(pool)),
        cache,
        config,
    ))
}

/// Every started task, stoppable as one unit.
pub struct Running {
    cancel: CancellationToken,
    dispatcher: DispatcherHandle,
    monitor: MonitorHandle,
    cache: CacheProvider,
}

impl Running {
    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats()
    }

    pub fn dispatcher(&self) -> &DispatcherHandle {
        &self.dispatcher
    }

    /// Cancel every task and wait for all of them to exit.
    pub async fn shutdown(self) -> StatsSnapshot {
        self.cancel.cancel();

        let stats = self.dispatcher.join().await;
        self.monitor.join().await;

        if let Err(e) = self.cache.close().await {
            tracing::warn!(error = %e, "cache close failed");
        }

        tracing::info!(
            processed = stats.processed,
            failed = stats.failed,
            reclaimed = stats.reclaimed,
            skipped = stats.skipped,
            "workers stopped"
        );
        stats
    }
}

/// Start the dispatcher and the monitor under one cancellation token.
pub async fn start(
    services: Services,
    config: &WorkerConfig,
    cancel: CancellationToken,
) -> anyhow::Result<Running> {
    let dispatcher = Dispatcher::new(
        services.queue.clone(),
        services.configs.clone(),
        services.processor.clone(),
        config.dispatcher(),
    )
    .start(cancel.clone())
    .await
    .context("failed to discover active tenants")?;

    let monitor = Arc::new(QueueMonitor::new(
        services.queue,
        services.configs,
        services.alerts,
        config.monitor(),
    ))
    .spawn(cancel.clone());

    Ok(Running {
        cancel,
        dispatcher,
        monitor,
        cache: services.cache,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use pirepsync_core::TenantId;
    use pirepsync_infra::records::InMemoryRecordStore;
    use pirepsync_infra::tenants::{
        InMemoryTenantConfigSource, ProviderConfig, AIRTABLE_PROVIDER,
    };
    use pirepsync_queue::{stream_name, InMemoryQueueStore, QueueItem};
    use serde_json::json;

    #[tokio::test]
    async fn starts_and_stops_with_in_memory_services() {
        let tenant_id = TenantId::new();
        let configs = Arc::new(InMemoryTenantConfigSource::new());
        configs.upsert(ProviderConfig::new(
            tenant_id,
            AIRTABLE_PROVIDER,
            json!({"schemas": {"pireps": {"fields": {"route": "Route"}}}}),
        ));
        let queue = InMemoryQueueStore::arc();
        let records = Arc::new(InMemoryRecordStore::new());

        let config = WorkerConfig {
            block_timeout: Duration::from_millis(50),
            ..WorkerConfig::default()
        };
        let services = Services::new(
            queue.clone(),
            configs,
            records.clone(),
            CacheProvider::memory(),
            &config,
        );

        let running = start(services, &config, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(running.dispatcher().tenants(), &[tenant_id]);

        queue
            .enqueue(
                &stream_name(tenant_id),
                &QueueItem::new(tenant_id, "rec1").with_field("Route", "EGLL-LFPG"),
            )
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while records.count(tenant_id).await.unwrap() == 0 {
            assert!(tokio::time::Instant::now() < deadline, "item was not processed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = tokio::time::timeout(Duration::from_secs(2), running.shutdown())
            .await
            .expect("shutdown hung");
        assert_eq!(stats.failed, 0);
    }
}
