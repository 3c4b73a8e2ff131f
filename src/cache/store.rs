//! In-process cache backend.
//!
//! LRU-bounded key/value store with a per-entry deadline. Expired entries are dropped lazily on
//! read; capacity pressure evicts the least recently used key.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use metrics::counter;
use tokio::time::Instant;

use crate::application::ports::{CacheBackend, CacheError};

use super::config::CacheConfig;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::store";
const METRIC_EVICT: &str = "fractory_read_cache_evict_total";

struct Entry {
    value: String,
    expires_at: Instant,
}

pub struct LocalCacheBackend {
    entries: Mutex<LruCache<String, Entry>>,
}

impl LocalCacheBackend {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(config.capacity_non_zero())),
        }
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheBackend for LocalCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = mutex_lock(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => {
                return Ok(Some(entry.value.clone()));
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        let mut entries = mutex_lock(&self.entries, SOURCE, "set");
        if let Some((evicted, _)) = entries.push(key.to_string(), entry)
            && evicted != key
        {
            counter!(METRIC_EVICT).increment(1);
        }
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), CacheError> {
        mutex_lock(&self.entries, SOURCE, "del").pop(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(capacity: usize) -> LocalCacheBackend {
        LocalCacheBackend::new(&CacheConfig {
            capacity,
            ..CacheConfig::default()
        })
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let cache = backend(4);
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some("v".to_string()));
        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let cache = backend(4);
        cache
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = backend(2);
        let ttl = Duration::from_secs(60);
        cache.set("a", "1".to_string(), ttl).await.unwrap();
        cache.set("b", "2".to_string(), ttl).await.unwrap();
        cache.get("a").await.unwrap();
        cache.set("c", "3".to_string(), ttl).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert!(cache.get("c").await.unwrap().is_some());
    }
}
