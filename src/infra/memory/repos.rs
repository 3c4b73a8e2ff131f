use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    application::repos::{
        GalleryQuery, GalleryRepo, GallerySortKey, HistoryRepo, LedgerRepo, ListPage, ListScope,
        NewJobRecord, RepoError, SortOrder, TransitionJobParams,
    },
    cache::lock::mutex_lock,
    domain::{
        entities::{GalleryEntryRecord, GalleryItem, HistoryEntryRecord, JobRecord, Requester},
        fingerprint::Fingerprint,
        request::RenderRequest,
        types::JobStatus,
    },
};

const SOURCE: &str = "infra::memory::repos";

#[derive(Debug, Clone)]
struct HistoryRow {
    id: Uuid,
    requester: Requester,
    fingerprint: Fingerprint,
    status: JobStatus,
    generated_at: OffsetDateTime,
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<Fingerprint, JobRecord>,
    gallery: Vec<GalleryEntryRecord>,
    history: Vec<HistoryRow>,
}

impl Tables {
    fn history_record(&self, row: &HistoryRow) -> HistoryEntryRecord {
        HistoryEntryRecord {
            id: row.id,
            requester: row.requester.clone(),
            fingerprint: row.fingerprint.clone(),
            status: row.status,
            generated_at: row.generated_at,
            request: self.jobs.get(&row.fingerprint).map(|job| job.request),
        }
    }
}

/// Ledger, gallery and history tables behind one lock, so every operation is atomic.
#[derive(Debug, Default)]
pub struct MemoryRepositories {
    tables: Mutex<Tables>,
}

impl MemoryRepositories {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> usize {
        mutex_lock(&self.tables, SOURCE, "job_count").jobs.len()
    }

    /// Overwrite a job row as-is; lets tests stage states the ledger would not produce directly.
    pub fn put_job(&self, job: JobRecord) {
        mutex_lock(&self.tables, SOURCE, "put_job")
            .jobs
            .insert(job.fingerprint.clone(), job);
    }
}

fn compare_f64(a: f64, b: f64) -> Ordering {
    a.total_cmp(&b)
}

fn compare_items(key: GallerySortKey, a: &GalleryItem, b: &GalleryItem) -> Ordering {
    let (ra, rb): (&RenderRequest, &RenderRequest) = (&a.request, &b.request);
    match key {
        GallerySortKey::AddedAt => a.entry.added_at.cmp(&b.entry.added_at),
        GallerySortKey::Width => ra.width.cmp(&rb.width),
        GallerySortKey::Height => ra.height.cmp(&rb.height),
        GallerySortKey::Iterations => ra.max_iterations.cmp(&rb.max_iterations),
        GallerySortKey::Power => compare_f64(ra.power, rb.power),
        GallerySortKey::Scale => compare_f64(ra.scale, rb.scale),
        GallerySortKey::ColourScheme => ra.colour_scheme.as_str().cmp(rb.colour_scheme.as_str()),
    }
}

fn page<T>(items: Vec<T>, limit: u32, offset: u32) -> ListPage<T> {
    let total_count = items.len() as u64;
    let items = items
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .collect();
    ListPage {
        items,
        total_count,
        limit,
        offset,
    }
}

fn in_scope(scope: &ListScope, requester_id: &str) -> bool {
    match scope {
        ListScope::All => true,
        ListScope::Requester(id) => id == requester_id,
    }
}

#[async_trait]
impl LedgerRepo for MemoryRepositories {
    async fn insert_job(&self, job: NewJobRecord) -> Result<JobRecord, RepoError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "insert_job");
        if tables.jobs.contains_key(&job.fingerprint) {
            return Err(RepoError::Duplicate {
                constraint: "render_jobs_fingerprint_key".to_string(),
            });
        }
        let record = JobRecord {
            id: job.id,
            fingerprint: job.fingerprint.clone(),
            request: job.request,
            status: JobStatus::Pending,
            retry_count: 0,
            created_at: job.created_at,
            last_updated: job.created_at,
            artifact_key: None,
        };
        tables.jobs.insert(job.fingerprint, record.clone());
        Ok(record)
    }

    async fn find_job(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, RepoError> {
        Ok(mutex_lock(&self.tables, SOURCE, "find_job")
            .jobs
            .get(fingerprint)
            .cloned())
    }

    async fn transition_job(
        &self,
        params: TransitionJobParams,
    ) -> Result<Option<JobRecord>, RepoError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "transition_job");
        let Some(job) = tables.jobs.get_mut(&params.fingerprint) else {
            return Ok(None);
        };
        if !params.from.contains(&job.status) {
            return Ok(None);
        }
        if params
            .expected_updated_at
            .is_some_and(|expected| expected != job.last_updated)
        {
            return Ok(None);
        }

        let mut next = job.clone();
        next.status = params.to;
        next.artifact_key = params.artifact_key;
        next.last_updated = params.at;
        if params.increment_retry {
            next.retry_count += 1;
        }
        if !next.artifact_invariant_holds() {
            return Err(RepoError::Integrity {
                message: "artifact_key must be set exactly when status is complete".to_string(),
            });
        }

        *job = next.clone();
        Ok(Some(next))
    }

    async fn delete_job(&self, fingerprint: &Fingerprint) -> Result<bool, RepoError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "delete_job");
        let removed = tables.jobs.remove(fingerprint).is_some();
        if removed {
            tables.gallery.retain(|entry| &entry.fingerprint != fingerprint);
        }
        Ok(removed)
    }

    async fn list_jobs_in(
        &self,
        statuses: &[JobStatus],
        limit: u32,
    ) -> Result<Vec<JobRecord>, RepoError> {
        let tables = mutex_lock(&self.tables, SOURCE, "list_jobs_in");
        let mut jobs: Vec<JobRecord> = tables
            .jobs
            .values()
            .filter(|job| statuses.contains(&job.status))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.last_updated.cmp(&b.last_updated));
        jobs.truncate(limit as usize);
        Ok(jobs)
    }
}

#[async_trait]
impl GalleryRepo for MemoryRepositories {
    async fn add_to_gallery(
        &self,
        requester_id: &str,
        fingerprint: &Fingerprint,
        added_at: OffsetDateTime,
    ) -> Result<GalleryEntryRecord, RepoError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "add_to_gallery");
        if !tables.jobs.contains_key(fingerprint) {
            return Err(RepoError::InvalidInput {
                message: format!("no job for fingerprint {fingerprint}"),
            });
        }
        if let Some(existing) = tables
            .gallery
            .iter()
            .find(|entry| entry.requester_id == requester_id && &entry.fingerprint == fingerprint)
        {
            return Ok(existing.clone());
        }
        let entry = GalleryEntryRecord {
            id: Uuid::new_v4(),
            requester_id: requester_id.to_string(),
            fingerprint: fingerprint.clone(),
            added_at,
        };
        tables.gallery.push(entry.clone());
        Ok(entry)
    }

    async fn find_gallery_entry(&self, id: Uuid) -> Result<Option<GalleryEntryRecord>, RepoError> {
        Ok(mutex_lock(&self.tables, SOURCE, "find_gallery_entry")
            .gallery
            .iter()
            .find(|entry| entry.id == id)
            .cloned())
    }

    async fn delete_gallery_entry(&self, id: Uuid) -> Result<bool, RepoError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "delete_gallery_entry");
        let before = tables.gallery.len();
        tables.gallery.retain(|entry| entry.id != id);
        Ok(tables.gallery.len() < before)
    }

    async fn count_gallery_references(&self, fingerprint: &Fingerprint) -> Result<u64, RepoError> {
        Ok(mutex_lock(&self.tables, SOURCE, "count_gallery_references")
            .gallery
            .iter()
            .filter(|entry| &entry.fingerprint == fingerprint)
            .count() as u64)
    }

    async fn list_gallery(
        &self,
        scope: &ListScope,
        query: &GalleryQuery,
    ) -> Result<ListPage<GalleryItem>, RepoError> {
        let tables = mutex_lock(&self.tables, SOURCE, "list_gallery");
        let mut items: Vec<GalleryItem> = tables
            .gallery
            .iter()
            .filter(|entry| in_scope(scope, &entry.requester_id))
            .filter_map(|entry| {
                let job = tables.jobs.get(&entry.fingerprint)?;
                Some(GalleryItem {
                    entry: entry.clone(),
                    request: job.request,
                    artifact_key: job.artifact_key.clone(),
                    url: None,
                })
            })
            .filter(|item| query.filter.matches(&item.request))
            .collect();

        items.sort_by(|a, b| {
            let ordering = compare_items(query.sort_by, a, b);
            let ordering = match query.sort_order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            };
            ordering.then_with(|| a.entry.id.cmp(&b.entry.id))
        });

        Ok(page(items, query.limit, query.offset))
    }
}

#[async_trait]
impl HistoryRepo for MemoryRepositories {
    async fn record_history(
        &self,
        requester: &Requester,
        fingerprint: &Fingerprint,
        status: JobStatus,
        at: OffsetDateTime,
    ) -> Result<HistoryEntryRecord, RepoError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "record_history");
        let position = tables
            .history
            .iter()
            .position(|row| row.requester.id == requester.id && &row.fingerprint == fingerprint);
        let row = match position {
            Some(index) => {
                let row = &mut tables.history[index];
                row.status = status;
                row.requester.display_name = requester.display_name.clone();
                row.clone()
            }
            None => {
                let row = HistoryRow {
                    id: Uuid::new_v4(),
                    requester: requester.clone(),
                    fingerprint: fingerprint.clone(),
                    status,
                    generated_at: at,
                };
                tables.history.push(row.clone());
                row
            }
        };
        Ok(tables.history_record(&row))
    }

    async fn update_history_status(
        &self,
        fingerprint: &Fingerprint,
        status: JobStatus,
    ) -> Result<u64, RepoError> {
        let mut tables = mutex_lock(&self.tables, SOURCE, "update_history_status");
        let mut updated = 0;
        for row in tables
            .history
            .iter_mut()
            .filter(|row| &row.fingerprint == fingerprint)
        {
            row.status = status;
            updated += 1;
        }
        Ok(updated)
    }

    async fn requesters_for(&self, fingerprint: &Fingerprint) -> Result<Vec<Requester>, RepoError> {
        Ok(mutex_lock(&self.tables, SOURCE, "requesters_for")
            .history
            .iter()
            .filter(|row| &row.fingerprint == fingerprint)
            .map(|row| row.requester.clone())
            .collect())
    }

    async fn list_history(
        &self,
        scope: &ListScope,
        limit: u32,
        offset: u32,
    ) -> Result<ListPage<HistoryEntryRecord>, RepoError> {
        let tables = mutex_lock(&self.tables, SOURCE, "list_history");
        let mut rows: Vec<&HistoryRow> = tables
            .history
            .iter()
            .filter(|row| in_scope(scope, &row.requester.id))
            .collect();
        rows.sort_by(|a, b| {
            b.generated_at
                .cmp(&a.generated_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        let records = rows.into_iter().map(|row| tables.history_record(row)).collect();
        Ok(page(records, limit, offset))
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::domain::types::{ColourScheme, Role};

    const T0: OffsetDateTime = datetime!(2026-01-01 00:00:00 UTC);

    fn new_job(request: RenderRequest) -> NewJobRecord {
        NewJobRecord {
            id: Uuid::new_v4(),
            fingerprint: Fingerprint::of(&request),
            request,
            created_at: T0,
        }
    }

    fn transition(
        fingerprint: &Fingerprint,
        from: &[JobStatus],
        to: JobStatus,
        artifact_key: Option<String>,
    ) -> TransitionJobParams {
        TransitionJobParams {
            fingerprint: fingerprint.clone(),
            from: from.to_vec(),
            to,
            expected_updated_at: None,
            increment_retry: false,
            artifact_key,
            at: T0,
        }
    }

    #[tokio::test]
    async fn second_insert_for_fingerprint_is_duplicate() {
        let repos = MemoryRepositories::new();
        let request = RenderRequest::default();
        repos.insert_job(new_job(request)).await.unwrap();

        let err = repos.insert_job(new_job(request)).await.unwrap_err();
        assert!(matches!(err, RepoError::Duplicate { .. }));
        assert_eq!(repos.job_count(), 1);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set_on_source_status() {
        let repos = MemoryRepositories::new();
        let job = repos.insert_job(new_job(RenderRequest::default())).await.unwrap();
        let fp = job.fingerprint.clone();

        let skipped = repos
            .transition_job(transition(&fp, &[JobStatus::Generating], JobStatus::TooComplex, None))
            .await
            .unwrap();
        assert!(skipped.is_none());

        let claimed = repos
            .transition_job(transition(&fp, &[JobStatus::Pending], JobStatus::Generating, None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.status, JobStatus::Generating);
    }

    #[tokio::test]
    async fn expected_timestamp_mismatch_skips() {
        let repos = MemoryRepositories::new();
        let job = repos.insert_job(new_job(RenderRequest::default())).await.unwrap();
        let mut params = transition(&job.fingerprint, &[JobStatus::Pending], JobStatus::Failed, None);
        params.expected_updated_at = Some(T0 + time::Duration::seconds(1));

        assert!(repos.transition_job(params).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn completion_without_artifact_violates_integrity() {
        let repos = MemoryRepositories::new();
        let job = repos.insert_job(new_job(RenderRequest::default())).await.unwrap();

        let err = repos
            .transition_job(transition(&job.fingerprint, &[JobStatus::Pending], JobStatus::Complete, None))
            .await
            .unwrap_err();
        assert!(matches!(err, RepoError::Integrity { .. }));
        let stored = repos.find_job(&job.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn gallery_add_is_idempotent_per_requester() {
        let repos = MemoryRepositories::new();
        let job = repos.insert_job(new_job(RenderRequest::default())).await.unwrap();

        let first = repos.add_to_gallery("u-1", &job.fingerprint, T0).await.unwrap();
        let again = repos.add_to_gallery("u-1", &job.fingerprint, T0).await.unwrap();
        repos.add_to_gallery("u-2", &job.fingerprint, T0).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(repos.count_gallery_references(&job.fingerprint).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn gallery_listing_filters_sorts_and_pages() {
        let repos = MemoryRepositories::new();
        for (index, width) in [300u32, 100, 200].into_iter().enumerate() {
            let request = RenderRequest {
                width,
                colour_scheme: if index == 0 { ColourScheme::Fire } else { ColourScheme::Rainbow },
                ..RenderRequest::default()
            };
            let job = repos.insert_job(new_job(request)).await.unwrap();
            repos
                .add_to_gallery("u-1", &job.fingerprint, T0 + time::Duration::seconds(index as i64))
                .await
                .unwrap();
        }

        let by_width = repos
            .list_gallery(
                &ListScope::Requester("u-1".to_string()),
                &GalleryQuery {
                    sort_by: GallerySortKey::Width,
                    sort_order: SortOrder::Asc,
                    limit: 2,
                    ..GalleryQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(by_width.total_count, 3);
        let widths: Vec<u32> = by_width.items.iter().map(|item| item.request.width).collect();
        assert_eq!(widths, vec![100, 200]);

        let newest_first = repos
            .list_gallery(&ListScope::All, &GalleryQuery::default())
            .await
            .unwrap();
        assert_eq!(newest_first.items[0].request.width, 200);

        let mut fire = GalleryQuery::default();
        fire.filter.colour_scheme = Some(ColourScheme::Fire);
        let filtered = repos.list_gallery(&ListScope::All, &fire).await.unwrap();
        assert_eq!(filtered.total_count, 1);
        assert_eq!(filtered.items[0].request.width, 300);

        let other_user = repos
            .list_gallery(&ListScope::Requester("u-2".to_string()), &GalleryQuery::default())
            .await
            .unwrap();
        assert_eq!(other_user.total_count, 0);
    }

    #[tokio::test]
    async fn history_survives_job_deletion() {
        let repos = MemoryRepositories::new();
        let job = repos.insert_job(new_job(RenderRequest::default())).await.unwrap();
        let alice = Requester::new("u-1", "alice", Role::User);
        repos
            .record_history(&alice, &job.fingerprint, JobStatus::Pending, T0)
            .await
            .unwrap();
        repos.add_to_gallery("u-1", &job.fingerprint, T0).await.unwrap();

        assert!(repos.delete_job(&job.fingerprint).await.unwrap());

        let history = repos
            .list_history(&ListScope::Requester("u-1".to_string()), 5, 0)
            .await
            .unwrap();
        assert_eq!(history.total_count, 1);
        assert!(history.items[0].fractal_deleted());
        assert_eq!(repos.count_gallery_references(&job.fingerprint).await.unwrap(), 0);
    }
}
