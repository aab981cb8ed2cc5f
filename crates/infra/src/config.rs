//! Environment-driven worker configuration.
//!
//! Every knob has a default. A value that fails to parse falls back to the
//! default and logs a warning instead of refusing to start.

use std::str::FromStr;
use std::time::Duration;

use crate::monitor::MonitorSettings;
use crate::workers::DispatcherSettings;

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";
pub const DEFAULT_WORKER_PREFIX: &str = "pirepsync";

/// Which cache backend holds resolved tenant schemas.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(CacheBackend::Memory),
            "redis" => Ok(CacheBackend::Redis),
            other => Err(format!("unknown cache backend {other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub database_url: Option<String>,
    pub worker_prefix: String,
    pub workers_per_tenant: usize,
    pub block_timeout: Duration,
    pub claim_interval: Duration,
    pub claim_min_idle: Duration,
    pub monitor_interval: Duration,
    pub trim_interval: Duration,
    pub trim_max_len: u64,
    pub pending_alert_threshold: u64,
    pub queue_alert_threshold: u64,
    pub cache_backend: CacheBackend,
    pub schema_cache_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            database_url: None,
            worker_prefix: DEFAULT_WORKER_PREFIX.to_string(),
            workers_per_tenant: 2,
            block_timeout: Duration::from_secs(5),
            claim_interval: Duration::from_secs(120),
            claim_min_idle: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(30),
            trim_interval: Duration::from_secs(600),
            trim_max_len: 10_000,
            pending_alert_threshold: 1_000,
            queue_alert_threshold: 5_000,
            cache_backend: CacheBackend::Memory,
            schema_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (used by tests).
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let text = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let secs = |key: &str, default: Duration| {
            Duration::from_secs(parsed(key, text(key), default.as_secs()))
        };
        // Tick periods and the blocking read need a non-zero duration.
        let period = |key: &str, default: Duration| match secs(key, default) {
            Duration::ZERO => {
                tracing::warn!(key, "zero is not a usable period; using {}s", default.as_secs());
                default
            }
            d => d,
        };

        let workers_per_tenant = match parsed(
            "WORKERS_PER_TENANT",
            text("WORKERS_PER_TENANT"),
            d.workers_per_tenant,
        ) {
            0 => {
                tracing::warn!(
                    "WORKERS_PER_TENANT=0 is not usable; using {}",
                    d.workers_per_tenant
                );
                d.workers_per_tenant
            }
            n => n,
        };

        Self {
            redis_url: text("REDIS_URL").unwrap_or(d.redis_url),
            database_url: text("DATABASE_URL"),
            worker_prefix: text("WORKER_PREFIX").unwrap_or(d.worker_prefix),
            workers_per_tenant,
            block_timeout: period("BLOCK_TIMEOUT_SECS", d.block_timeout),
            claim_interval: period("CLAIM_INTERVAL_SECS", d.claim_interval),
            claim_min_idle: secs("CLAIM_MIN_IDLE_SECS", d.claim_min_idle),
            monitor_interval: period("MONITOR_INTERVAL_SECS", d.monitor_interval),
            trim_interval: period("TRIM_INTERVAL_SECS", d.trim_interval),
            trim_max_len: parsed("TRIM_MAX_LEN", text("TRIM_MAX_LEN"), d.trim_max_len),
            pending_alert_threshold: parsed(
                "PENDING_ALERT_THRESHOLD",
                text("PENDING_ALERT_THRESHOLD"),
                d.pending_alert_threshold,
            ),
            queue_alert_threshold: parsed(
                "QUEUE_ALERT_THRESHOLD",
                text("QUEUE_ALERT_THRESHOLD"),
                d.queue_alert_threshold,
            ),
            cache_backend: parsed("CACHE_BACKEND", text("CACHE_BACKEND"), d.cache_backend),
            schema_cache_ttl: secs("SCHEMA_CACHE_TTL_SECS", d.schema_cache_ttl),
        }
    }

    pub fn dispatcher(&self) -> DispatcherSettings {
        DispatcherSettings {
            worker_prefix: self.worker_prefix.clone(),
            workers_per_tenant: self.workers_per_tenant,
            block_timeout: self.block_timeout,
            claim_interval: self.claim_interval,
            claim_min_idle: self.claim_min_idle,
            ..DispatcherSettings::default()
        }
    }

    pub fn monitor(&self) -> MonitorSettings {
        MonitorSettings {
            check_interval: self.monitor_interval,
            trim_interval: self.trim_interval,
            trim_max_len: self.trim_max_len,
            pending_threshold: self.pending_alert_threshold,
            queue_threshold: self.queue_alert_threshold,
        }
    }
}

fn parsed<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + core::fmt::Debug,
    T::Err: core::fmt::Display,
{
    match raw {
        None => default,
        Some(raw) => match raw.parse::<T>() {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(
                    key,
                    value = %raw,
                    error = %e,
                    "invalid config value; using default {default:?}"
                );
                default
            }
        },
    }
}
