//! Memoized list pages over the gallery and history repositories.
//!
//! Pages are filled lazily on a miss and dropped eagerly by [`ReadCache::invalidate_for_requester`]
//! whenever a mutation can change a default first page. Anything else ages out by TTL. The cache
//! is advisory: a backend failure degrades to a direct repository read.
//!
//! Each invalidated key carries a generation. A fill whose load started before an invalidation
//! of its key is discarded, so a page read before a mutation never outlives that mutation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::application::ports::CacheBackend;

use super::config::CacheConfig;
use super::keys::{ReadQuery, keys_affected_by};
use super::lock::mutex_lock;

const SOURCE: &str = "cache::read_cache";
const METRIC_HIT: &str = "fractory_read_cache_hit_total";
const METRIC_MISS: &str = "fractory_read_cache_miss_total";

#[derive(Clone)]
pub struct ReadCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
    generations: Arc<Mutex<HashMap<String, u64>>>,
}

impl ReadCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            config,
            generations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn generation(&self, key: &str) -> u64 {
        mutex_lock(&self.generations, SOURCE, "generation")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn bump_generation(&self, key: &str) {
        *mutex_lock(&self.generations, SOURCE, "bump_generation")
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    async fn fill(&self, key: &str, raw: String, observed: u64) {
        if self.generation(key) != observed {
            debug!(target = SOURCE, key, "skipping fill invalidated during load");
            return;
        }
        if let Err(err) = self.backend.set(key, raw, self.config.ttl()).await {
            warn!(target = SOURCE, key, error = %err, "read-cache fill failed");
            return;
        }
        // An invalidation that landed between the check and the write deletes before we do.
        if self.generation(key) != observed
            && let Err(err) = self.backend.del(key).await
        {
            warn!(target = SOURCE, key, error = %err, "read-cache stale fill removal failed");
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub async fn get_or_load<T, E, F, Fut>(&self, query: &ReadQuery, load: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return load().await;
        }

        let key = query.cache_key();
        match self.backend.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str::<T>(&raw) {
                Ok(value) => {
                    counter!(METRIC_HIT).increment(1);
                    debug!(target = SOURCE, key = %key, "read-cache hit");
                    return Ok(value);
                }
                Err(err) => {
                    warn!(target = SOURCE, key = %key, error = %err, "discarding undecodable cache entry");
                }
            },
            Ok(None) => {}
            Err(err) => {
                warn!(target = SOURCE, key = %key, error = %err, "read-cache lookup failed");
            }
        }

        counter!(METRIC_MISS).increment(1);
        let observed = self.generation(&key);
        let value = load().await?;

        match serde_json::to_string(&value) {
            Ok(raw) => self.fill(&key, raw, observed).await,
            Err(err) => {
                warn!(target = SOURCE, key = %key, error = %err, "read-cache value not serializable");
            }
        }
        Ok(value)
    }

    /// Drop the default first pages a mutation on `requester_id`'s entries can change: theirs
    /// and the admin-wide view.
    pub async fn invalidate_for_requester(&self, requester_id: &str) {
        if !self.config.enabled {
            return;
        }
        for key in keys_affected_by(requester_id) {
            self.bump_generation(&key);
            if let Err(err) = self.backend.del(&key).await {
                warn!(target = SOURCE, key = %key, error = %err, "read-cache invalidation failed");
            }
        }
        debug!(target = SOURCE, requester_id, "read-cache invalidated");
    }
}
