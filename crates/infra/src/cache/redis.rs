//! Redis cache backend.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use super::{CacheError, CacheResult, CacheService};

/// Redis-backed cache using an auto-reconnecting `ConnectionManager`.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    key_prefix: String,
}

impl core::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisCache")
            .field("conn", &"ConnectionManager")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisCache {
    pub async fn connect(
        redis_url: impl AsRef<str>,
        key_prefix: impl Into<String>,
    ) -> CacheResult<Self> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| CacheError::Connection(format!("failed to create Redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Connection(format!("failed to connect to Redis: {e}")))?;

        Ok(Self {
            conn,
            key_prefix: key_prefix.into(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

#[async_trait]
impl CacheService for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(self.key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("GET failed: {e}")))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let ttl_secs = ttl.as_secs().max(1);

        redis::cmd("SETEX")
            .arg(self.key(key))
            .arg(ttl_secs)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("SETEX failed: {e}")))?;

        debug!(key, ttl_secs, "cache set");
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(self.key(key))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| CacheError::Backend(format!("DEL failed: {e}")))
    }

    async fn close(&self) -> CacheResult<()> {
        // The manager's connection closes when the last clone is dropped.
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}
