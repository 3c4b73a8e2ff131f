//! Gallery and history views, and reclamation of unreferenced fractals.

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    application::{
        context::PipelineContext,
        error::AppError,
        identity::{IdentityError, require_admin},
        repos::{GalleryQuery, ListPage, ListScope},
    },
    cache::ReadQuery,
    domain::{
        entities::{GalleryItem, HistoryEntryRecord, JobRecord, Requester},
        types::JobStatus,
    },
};

const SOURCE: &str = "application::gallery";

/// What deleting a gallery entry ended up removing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Other references remain; the job and its artifact stay.
    EntryRemoved,
    /// That was the last reference; the artifact and the job row are gone too.
    FractalReclaimed,
}

impl DeleteOutcome {
    pub fn message(self) -> &'static str {
        match self {
            DeleteOutcome::EntryRemoved => "Gallery entry deleted successfully",
            DeleteOutcome::FractalReclaimed => {
                "Gallery entry and associated fractal deleted successfully"
            }
        }
    }
}

/// Make a completed job visible in `requester`'s gallery and history.
pub(crate) async fn attach_completed(
    ctx: &PipelineContext,
    requester: &Requester,
    job: &JobRecord,
) -> Result<(), AppError> {
    let now = ctx.ledger.clock().now();
    ctx.history
        .record_history(requester, &job.fingerprint, JobStatus::Complete, now)
        .await?;
    ctx.gallery
        .add_to_gallery(&requester.id, &job.fingerprint, now)
        .await?;
    ctx.read_cache.invalidate_for_requester(&requester.id).await;
    Ok(())
}

fn scope_for(requester: &Requester, all: bool) -> Result<ListScope, IdentityError> {
    if all {
        require_admin(requester)?;
        Ok(ListScope::All)
    } else {
        Ok(ListScope::Requester(requester.id.clone()))
    }
}

#[derive(Clone)]
pub struct GalleryService {
    ctx: PipelineContext,
}

impl GalleryService {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    /// A page of gallery items, each with a presigned artifact URL. `all` spans every
    /// requester and is admin-only.
    pub async fn list_gallery(
        &self,
        requester: &Requester,
        all: bool,
        query: GalleryQuery,
    ) -> Result<ListPage<GalleryItem>, AppError> {
        let scope = scope_for(requester, all)?;
        let query = query.normalized();
        let read = ReadQuery::gallery(scope.clone(), query.clone());

        self.ctx
            .read_cache
            .get_or_load(&read, || async {
                let mut page = self.ctx.gallery.list_gallery(&scope, &query).await?;
                for item in &mut page.items {
                    if let Some(key) = item.artifact_key.as_deref() {
                        item.url = Some(self.ctx.artifacts.presign(key, self.ctx.presign_ttl).await?);
                    }
                }
                Ok::<_, AppError>(page)
            })
            .await
    }

    pub async fn list_history(
        &self,
        requester: &Requester,
        all: bool,
        limit: u32,
        offset: u32,
    ) -> Result<ListPage<HistoryEntryRecord>, AppError> {
        let scope = scope_for(requester, all)?;
        let window = GalleryQuery {
            limit,
            offset,
            ..GalleryQuery::default()
        }
        .normalized();
        let read = ReadQuery::history(scope.clone(), window.limit, window.offset);

        self.ctx
            .read_cache
            .get_or_load(&read, || async {
                self.ctx
                    .history
                    .list_history(&scope, window.limit, window.offset)
                    .await
                    .map_err(AppError::from)
            })
            .await
    }

    /// Delete one gallery entry. Owners may delete their own entries, admins any. Removing the
    /// last reference to a fractal reclaims its artifact and job row; history entries survive and
    /// report the fractal as deleted.
    pub async fn delete_entry(
        &self,
        requester: &Requester,
        entry_id: Uuid,
    ) -> Result<DeleteOutcome, AppError> {
        let entry = self
            .ctx
            .gallery
            .find_gallery_entry(entry_id)
            .await?
            .ok_or(AppError::NotFound)?;
        if entry.requester_id != requester.id {
            require_admin(requester)?;
        }

        if !self.ctx.gallery.delete_gallery_entry(entry_id).await? {
            return Err(AppError::NotFound);
        }
        self.ctx
            .read_cache
            .invalidate_for_requester(&entry.requester_id)
            .await;

        let remaining = self
            .ctx
            .gallery
            .count_gallery_references(&entry.fingerprint)
            .await?;
        if remaining > 0 {
            info!(
                target = SOURCE,
                entry_id = %entry_id,
                fingerprint = %entry.fingerprint,
                remaining,
                "gallery entry deleted"
            );
            return Ok(DeleteOutcome::EntryRemoved);
        }

        // The job row goes first: a complete job must never point at a missing artifact, while an
        // orphaned artifact is unreachable and harmless.
        let artifact_key = self
            .ctx
            .ledger
            .find(&entry.fingerprint)
            .await?
            .and_then(|job| job.artifact_key);
        self.ctx.ledger.delete(&entry.fingerprint).await?;
        if let Some(key) = artifact_key.as_deref()
            && let Err(err) = self.ctx.artifacts.delete(key).await
        {
            warn!(
                target = SOURCE,
                fingerprint = %entry.fingerprint,
                artifact_key = key,
                error = %err,
                "artifact left orphaned after reclaim"
            );
        }

        // Every history view that showed this fractal now shows it as deleted.
        match self.ctx.history.requesters_for(&entry.fingerprint).await {
            Ok(requesters) => {
                for other in requesters {
                    self.ctx.read_cache.invalidate_for_requester(&other.id).await;
                }
            }
            Err(err) => warn!(
                target = SOURCE,
                fingerprint = %entry.fingerprint,
                error = %err,
                "could not resolve history owners for invalidation"
            ),
        }

        info!(
            target = SOURCE,
            entry_id = %entry_id,
            fingerprint = %entry.fingerprint,
            "last gallery reference deleted; fractal reclaimed"
        );
        Ok(DeleteOutcome::FractalReclaimed)
    }
}
