use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::application::ports::{ArtifactStore, StorageError};
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "infra::memory::artifacts";

#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    puts: AtomicUsize,
    fail_puts: AtomicBool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `put` calls so far.
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        mutex_lock(&self.objects, SOURCE, "contains").contains_key(key)
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.objects, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        mutex_lock(&self.objects, SOURCE, "content_type")
            .get(key)
            .map(|(_, content_type)| content_type.clone())
    }

    /// Make subsequent `put` calls fail until switched back.
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StorageError> {
        if key.is_empty() {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected put failure".to_string()));
        }
        mutex_lock(&self.objects, SOURCE, "put")
            .insert(key.to_string(), (bytes, content_type.to_string()));
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        Ok(mutex_lock(&self.objects, SOURCE, "get")
            .get(key)
            .map(|(bytes, _)| bytes.clone()))
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        Ok(format!("memory://{key}?ttl={}", ttl.as_secs()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        mutex_lock(&self.objects, SOURCE, "delete").remove(key);
        Ok(())
    }
}
