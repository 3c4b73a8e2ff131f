//! Domain records shared between the ledger, gallery and history views.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use super::fingerprint::Fingerprint;
use super::request::RenderRequest;
use super::types::{JobStatus, Role};

/// Verified identity of whoever submitted or is querying a render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Requester {
    pub id: String,
    pub display_name: String,
    pub role: Role,
}

impl Requester {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// Ledger row, one per fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub request: RenderRequest,
    pub status: JobStatus,
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    pub artifact_key: Option<String>,
}

impl JobRecord {
    /// `artifact_key` is present exactly when the job is complete.
    pub fn artifact_invariant_holds(&self) -> bool {
        self.artifact_key.is_some() == (self.status == JobStatus::Complete)
    }
}

/// A requester's reference to a completed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryEntryRecord {
    pub id: Uuid,
    pub requester_id: String,
    pub fingerprint: Fingerprint,
    #[serde(with = "time::serde::rfc3339")]
    pub added_at: OffsetDateTime,
}

/// Gallery entry joined with the job it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryItem {
    pub entry: GalleryEntryRecord,
    pub request: RenderRequest,
    pub artifact_key: Option<String>,
    pub url: Option<String>,
}

/// One submission of a fingerprint by a requester. Outlives the job it points to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntryRecord {
    pub id: Uuid,
    pub requester: Requester,
    pub fingerprint: Fingerprint,
    pub status: JobStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    /// `None` once the referenced job has been reclaimed.
    pub request: Option<RenderRequest>,
}

impl HistoryEntryRecord {
    pub fn fractal_deleted(&self) -> bool {
        self.request.is_none()
    }
}
