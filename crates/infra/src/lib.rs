//! Infrastructure layer: Redis broker, Postgres storage, cache, tenant config,
//! and the long-running worker and monitor tasks.

pub mod broker;
pub mod cache;
pub mod config;
pub mod monitor;
pub mod processor;
pub mod records;
pub mod tenants;
pub mod workers;


pub use config::{CacheBackend, WorkerConfig};
pub use monitor::{
    AlertSink, CountingAlertSink, HealthStatus, LogAlertSink, MonitorHandle, MonitorSettings,
    QueueHealthSnapshot, QueueMonitor,
};
pub use processor::{ProcessError, RecordProcessor};
pub use workers::{Dispatcher, DispatcherHandle, DispatcherSettings, StatsSnapshot};
