use anyhow::Context;
use tokio_util::sync::CancellationToken;

use pirepsync_infra::WorkerConfig;
use pirepsync_worker::app;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pirepsync_observability::init();

    let config = WorkerConfig::from_env();
    tracing::info!(
        worker_prefix = %config.worker_prefix,
        workers_per_tenant = config.workers_per_tenant,
        cache_backend = ?config.cache_backend,
        "starting pirep sync workers"
    );

    let services = app::build_services(&config).await?;
    let running = app::start(services, &config, CancellationToken::new()).await?;

    shutdown_signal().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown signal received; draining workers");

    running.shutdown().await;
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}
