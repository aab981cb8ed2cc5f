//! Cache capability.
//!
//! ```text
//! CacheProvider (enum)          <- chosen by configuration
//!   ├── Memory(InMemoryCache)     <- TTL map, single process
//!   └── Redis(RedisCache)         <- ConnectionManager + SETEX, shared
//! ```
//!
//! Cache failures are never fatal to callers: `get_or_load` falls back to the
//! loader and logs.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache connection error: {0}")]
    Connection(String),

    #[error("cache backend error: {0}")]
    Backend(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// String-valued cache operations shared by every backend.
#[async_trait]
pub trait CacheService: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    async fn delete(&self, key: &str) -> CacheResult<()>;

    /// Release backend resources. Further calls behave like misses.
    async fn close(&self) -> CacheResult<()>;

    fn provider_name(&self) -> &'static str;
}

/// Backend selected at startup.
#[derive(Debug, Clone)]
pub enum CacheProvider {
    Memory(InMemoryCache),
    #[cfg(feature = "redis")]
    Redis(Box<RedisCache>),
}

impl CacheProvider {
    pub fn memory() -> Self {
        Self::Memory(InMemoryCache::new())
    }

    fn backend(&self) -> &dyn CacheService {
        match self {
            Self::Memory(c) => c as &dyn CacheService,
            #[cfg(feature = "redis")]
            Self::Redis(c) => c.as_ref() as &dyn CacheService,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.backend().provider_name()
    }

    pub async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        self.backend().get(key).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        self.backend().set(key, value, ttl).await
    }

    pub async fn delete(&self, key: &str) -> CacheResult<()> {
        self.backend().delete(key).await
    }

    pub async fn close(&self) -> CacheResult<()> {
        self.backend().close().await
    }

    /// Typed read-through: return the cached JSON value for `key`, or run
    /// `load`, store its result for `ttl`, and return it.
    ///
    /// Cache read/write failures are logged and bypassed; only loader errors
    /// reach the caller.
    pub async fn get_or_load<T, E, F, Fut>(&self, key: &str, ttl: Duration, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    debug!(key, provider = self.provider_name(), "cache hit");
                    return Ok(value);
                }
                Err(e) => warn!(key, error = %e, "discarding undecodable cache entry"),
            },
            Ok(None) => debug!(key, provider = self.provider_name(), "cache miss"),
            Err(e) => warn!(key, error = %e, "cache read failed; loading directly"),
        }

        let value = load().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => {
                if let Err(e) = self.set(key, &raw, ttl).await {
                    warn!(key, error = %e, "cache write failed");
                }
            }
            Err(e) => warn!(key, error = %e, "value not cacheable"),
        }

        Ok(value)
    }
}
