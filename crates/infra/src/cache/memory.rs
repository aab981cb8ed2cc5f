//! In-process TTL cache.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheResult, CacheService};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

/// TTL map behind an `RwLock`. Expired entries are dropped lazily on read.
///
/// Not shared across processes.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    inner: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheService for InMemoryCache {
    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let now = Instant::now();
        {
            let map = self.inner.read().unwrap_or_else(|p| p.into_inner());
            match map.get(key) {
                Some(e) if e.expires_at > now => return Ok(Some(e.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        // Expired: evict.
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if map.get(key).is_some_and(|e| e.expires_at <= now) {
            map.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        map.remove(key);
        Ok(())
    }

    async fn close(&self) -> CacheResult<()> {
        let mut map = self.inner.write().unwrap_or_else(|p| p.into_inner());
        map.clear();
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}
