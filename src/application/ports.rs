//! Interfaces of the external collaborators the pipeline talks to: object storage, the work
//! queue and the shared cache backend.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entities::Requester;
use crate::domain::fingerprint::Fingerprint;
use crate::domain::request::RenderRequest;

pub const PNG_CONTENT_TYPE: &str = "image/png";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid artifact key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("artifact backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    /// Time-limited access reference for `key`.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError>;

    /// Missing keys are treated as success.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

/// Body of a queued render: everything a worker needs without re-reading the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub request: RenderRequest,
    pub fingerprint: Fingerprint,
    pub requester: Requester,
    pub job_id: Uuid,
}

/// A delivery of a queued message. The body stays raw so a malformed payload can be detected
/// and discarded by the worker.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// 1 on first delivery.
    pub receive_count: u32,
}

impl ReceivedMessage {
    pub fn decode(&self) -> Result<QueueMessage, serde_json::Error> {
        serde_json::from_str(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to encode queue message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("queue backend error: {0}")]
    Backend(String),
}

/// At-least-once queue: a received message becomes visible again after the visibility timeout
/// unless it is deleted through its receipt handle.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, message: &QueueMessage) -> Result<String, QueueError>;

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    async fn delete(&self, receipt_handle: &str) -> Result<(), QueueError>;
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    async fn del(&self, key: &str) -> Result<(), CacheError>;
}
