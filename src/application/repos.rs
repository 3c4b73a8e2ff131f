//! Repository traits describing persistence adapters.

use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::domain::entities::{
    GalleryEntryRecord, GalleryItem, HistoryEntryRecord, JobRecord, Requester,
};
use crate::domain::fingerprint::Fingerprint;
use crate::domain::request::RenderRequest;
use crate::domain::types::{ColourScheme, JobStatus};

pub const DEFAULT_PAGE_LIMIT: u32 = 5;
pub const MAX_PAGE_LIMIT: u32 = 100;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NewJobRecord {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub request: RenderRequest,
    pub created_at: OffsetDateTime,
}

/// Compare-and-set transition: applied only if the row is still in one of `from` (and, when
/// given, still carries `expected_updated_at`).
#[derive(Debug, Clone)]
pub struct TransitionJobParams {
    pub fingerprint: Fingerprint,
    pub from: Vec<JobStatus>,
    pub to: JobStatus,
    pub expected_updated_at: Option<OffsetDateTime>,
    pub increment_retry: bool,
    pub artifact_key: Option<String>,
    pub at: OffsetDateTime,
}

#[async_trait]
pub trait LedgerRepo: Send + Sync {
    /// Insert a new job; a second insert for the same fingerprint fails with
    /// [`RepoError::Duplicate`].
    async fn insert_job(&self, job: NewJobRecord) -> Result<JobRecord, RepoError>;

    async fn find_job(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, RepoError>;

    /// Returns `None` when the row was missing or no longer in an expected source state.
    async fn transition_job(
        &self,
        params: TransitionJobParams,
    ) -> Result<Option<JobRecord>, RepoError>;

    async fn delete_job(&self, fingerprint: &Fingerprint) -> Result<bool, RepoError>;

    async fn list_jobs_in(
        &self,
        statuses: &[JobStatus],
        limit: u32,
    ) -> Result<Vec<JobRecord>, RepoError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GallerySortKey {
    #[default]
    AddedAt,
    Width,
    Height,
    Iterations,
    Power,
    Scale,
    ColourScheme,
}

impl GallerySortKey {
    pub fn as_str(self) -> &'static str {
        match self {
            GallerySortKey::AddedAt => "added_at",
            GallerySortKey::Width => "width",
            GallerySortKey::Height => "height",
            GallerySortKey::Iterations => "iterations",
            GallerySortKey::Power => "power",
            GallerySortKey::Scale => "scale",
            GallerySortKey::ColourScheme => "colour_scheme",
        }
    }

    /// Unknown keys fall back to `added_at` rather than failing the read.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw {
            "width" => Self::Width,
            "height" => Self::Height,
            "iterations" | "maxIterations" => Self::Iterations,
            "power" => Self::Power,
            "scale" => Self::Scale,
            "colourScheme" | "colour_scheme" => Self::ColourScheme,
            _ => Self::AddedAt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

impl FromStr for SortOrder {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("asc") {
            Ok(Self::Asc)
        } else {
            Ok(Self::Desc)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryFilter {
    pub colour_scheme: Option<ColourScheme>,
    pub power: Option<f64>,
    pub iterations: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl GalleryFilter {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, request: &RenderRequest) -> bool {
        self.colour_scheme
            .is_none_or(|scheme| scheme == request.colour_scheme)
            && self.power.is_none_or(|power| power == request.power)
            && self
                .iterations
                .is_none_or(|iterations| iterations == request.max_iterations)
            && self.width.is_none_or(|width| width == request.width)
            && self.height.is_none_or(|height| height == request.height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GalleryQuery {
    pub filter: GalleryFilter,
    pub sort_by: GallerySortKey,
    pub sort_order: SortOrder,
    pub limit: u32,
    pub offset: u32,
}

impl Default for GalleryQuery {
    fn default() -> Self {
        Self {
            filter: GalleryFilter::default(),
            sort_by: GallerySortKey::default(),
            sort_order: SortOrder::default(),
            limit: DEFAULT_PAGE_LIMIT,
            offset: 0,
        }
    }
}

impl GalleryQuery {
    pub fn normalized(mut self) -> Self {
        self.limit = self.limit.clamp(1, MAX_PAGE_LIMIT);
        self
    }
}

/// Whose entries a list view spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListScope {
    Requester(String),
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListPage<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub limit: u32,
    pub offset: u32,
}

#[async_trait]
pub trait GalleryRepo: Send + Sync {
    /// Idempotent on `(requester, fingerprint)`: returns the existing entry when present.
    async fn add_to_gallery(
        &self,
        requester_id: &str,
        fingerprint: &Fingerprint,
        added_at: OffsetDateTime,
    ) -> Result<GalleryEntryRecord, RepoError>;

    async fn find_gallery_entry(&self, id: Uuid) -> Result<Option<GalleryEntryRecord>, RepoError>;

    async fn delete_gallery_entry(&self, id: Uuid) -> Result<bool, RepoError>;

    async fn count_gallery_references(&self, fingerprint: &Fingerprint) -> Result<u64, RepoError>;

    async fn list_gallery(
        &self,
        scope: &ListScope,
        query: &GalleryQuery,
    ) -> Result<ListPage<GalleryItem>, RepoError>;
}

#[async_trait]
pub trait HistoryRepo: Send + Sync {
    /// Idempotent on `(requester, fingerprint)`.
    async fn record_history(
        &self,
        requester: &Requester,
        fingerprint: &Fingerprint,
        status: JobStatus,
        at: OffsetDateTime,
    ) -> Result<HistoryEntryRecord, RepoError>;

    /// Mirror a ledger transition onto every history entry of the fingerprint.
    async fn update_history_status(
        &self,
        fingerprint: &Fingerprint,
        status: JobStatus,
    ) -> Result<u64, RepoError>;

    /// Everyone who has submitted this fingerprint.
    async fn requesters_for(&self, fingerprint: &Fingerprint) -> Result<Vec<Requester>, RepoError>;

    async fn list_history(
        &self,
        scope: &ListScope,
        limit: u32,
        offset: u32,
    ) -> Result<ListPage<HistoryEntryRecord>, RepoError>;
}
