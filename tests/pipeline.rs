//! End-to-end pipeline behaviour against the in-memory adapters.
//!
//! Workers are driven by hand through `poll_once` so every interleaving is deterministic, and
//! the ledger clock is a `ManualClock` so staleness guards can be crossed without sleeping.

use std::{sync::Arc, time::Duration};

use fractory::{
    application::{
        clock::ManualClock,
        context::PipelineContext,
        error::AppError,
        gallery::DeleteOutcome,
        identity::IdentityError,
        jobs::{MessageDisposition, WorkerContext, WorkerOptions, poll_once, process_message},
        ledger::JobLedger,
        ports::{QueueError, QueueMessage, ReceivedMessage},
        repos::{GalleryQuery, LedgerRepo, NewJobRecord, RepoError, TransitionJobParams},
    },
    cache::{CacheConfig, LocalCacheBackend, ReadCache},
    domain::{
        entities::{JobRecord, Requester},
        fingerprint::Fingerprint,
        lifecycle::StalenessPolicy,
        request::{RenderRequest, RenderRequestInput},
        types::{JobStatus, Role},
    },
    infra::memory::{MemoryArtifactStore, MemoryQueue, MemoryRepositories},
};
use async_trait::async_trait;
use time::macros::datetime;

struct Harness {
    ctx: PipelineContext,
    worker: WorkerContext,
    repos: Arc<MemoryRepositories>,
    queue: Arc<MemoryQueue>,
    artifacts: Arc<MemoryArtifactStore>,
    clock: Arc<ManualClock>,
}

fn harness() -> Harness {
    harness_with(Duration::from_secs(30))
}

fn harness_with(max_render_time: Duration) -> Harness {
    let repos = Arc::new(MemoryRepositories::new());
    let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30)));
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let clock = Arc::new(ManualClock::new(datetime!(2026-01-01 00:00 UTC)));

    let cache_config = CacheConfig::default();
    let ctx = PipelineContext {
        ledger: JobLedger::new(repos.clone(), clock.clone()),
        gallery: repos.clone(),
        history: repos.clone(),
        queue: queue.clone(),
        artifacts: artifacts.clone(),
        read_cache: ReadCache::new(
            Arc::new(LocalCacheBackend::new(&cache_config)),
            cache_config,
        ),
        staleness: StalenessPolicy::default(),
        presign_ttl: Duration::from_secs(3600),
    };
    let worker = WorkerContext::new(
        ctx.clone(),
        WorkerOptions {
            max_render_time,
            receive_wait: Duration::ZERO,
            ..WorkerOptions::default()
        },
    );

    Harness {
        ctx,
        worker,
        repos,
        queue,
        artifacts,
        clock,
    }
}

fn small(width: u32) -> RenderRequestInput {
    RenderRequestInput {
        width: Some(width),
        height: Some(24),
        max_iterations: Some(40),
        scale: Some(1.5),
        ..RenderRequestInput::default()
    }
}

fn alice() -> Requester {
    Requester::new("u-alice", "alice", Role::User)
}

fn bob() -> Requester {
    Requester::new("u-bob", "bob", Role::User)
}

fn admin() -> Requester {
    Requester::new("u-admin", "root", Role::Admin)
}

async fn status_of(h: &Harness, fingerprint: &Fingerprint) -> Option<JobStatus> {
    h.ctx
        .ledger
        .find(fingerprint)
        .await
        .expect("ledger read")
        .map(|job| job.status)
}

#[tokio::test]
async fn concurrent_identical_submissions_render_once() {
    let h = harness();
    let submissions = h.ctx.submissions();
    let request = RenderRequestInput {
        width: Some(100),
        height: Some(100),
        max_iterations: Some(50),
        power: Some(2.0),
        c_real: Some(0.285),
        c_imag: Some(0.01),
        scale: Some(1.5),
        colour_scheme: Some("rainbow".to_string()),
        ..RenderRequestInput::default()
    };
    let (alice_requester, bob_requester) = (alice(), bob());
    let (a, b) = tokio::join!(
        submissions.submit_input(&request, &alice_requester),
        submissions.submit_input(&request, &bob_requester),
    );
    let (a, b) = (a.expect("alice submits"), b.expect("bob submits"));

    assert_eq!(a.fingerprint, b.fingerprint);
    assert_eq!(h.repos.job_count(), 1);
    assert_eq!(h.queue.len(), 1);
    assert_eq!(
        [a.queued, b.queued].iter().filter(|queued| **queued).count(),
        1
    );

    assert_eq!(poll_once(&h.worker).await, 1);
    assert_eq!(h.artifacts.put_count(), 1);
    assert_eq!(status_of(&h, &a.fingerprint).await, Some(JobStatus::Complete));
    assert_eq!(
        h.artifacts.content_type(&a.fingerprint.artifact_key()).as_deref(),
        Some("image/png")
    );

    let galleries = h.ctx.galleries();
    for requester in [alice(), bob()] {
        let page = galleries
            .list_gallery(&requester, false, GalleryQuery::default())
            .await
            .expect("gallery lists");
        assert_eq!(page.total_count, 1, "{} sees the shared render", requester.id);
        assert!(page.items[0].url.is_some());
    }
}

#[tokio::test]
async fn resubmitting_a_completed_request_reuses_the_artifact() {
    let h = harness();
    let submissions = h.ctx.submissions();
    let first = submissions
        .submit_input(&small(40), &alice())
        .await
        .expect("submit");
    assert!(first.queued);
    poll_once(&h.worker).await;

    let again = submissions
        .submit_input(&small(40), &bob())
        .await
        .expect("resubmit");
    assert!(!again.queued);
    assert_eq!(again.status, JobStatus::Complete);
    assert_eq!(again.message, "Fractal already exists.");
    assert!(again.artifact_url.is_some());
    assert_eq!(h.artifacts.put_count(), 1);
    assert!(h.queue.is_empty());

    let bob_page = h
        .ctx
        .galleries()
        .list_gallery(&bob(), false, GalleryQuery::default())
        .await
        .expect("gallery lists");
    assert_eq!(bob_page.total_count, 1);
}

#[tokio::test]
async fn semantically_equal_requests_share_a_fingerprint() {
    let h = harness();
    let submissions = h.ctx.submissions();
    let explicit = RenderRequestInput {
        colour_scheme: Some("rainbow".to_string()),
        offset_x: Some(0.0),
        ..small(36)
    };

    let a = submissions.submit_input(&small(36), &alice()).await.expect("submit");
    let b = submissions.submit_input(&explicit, &alice()).await.expect("submit");

    assert_eq!(a.fingerprint, b.fingerprint);
    assert!(!b.queued);
    assert_eq!(h.repos.job_count(), 1);
}

#[tokio::test]
async fn over_budget_render_is_too_complex_and_never_retried() {
    let h = harness_with(Duration::ZERO);
    let submissions = h.ctx.submissions();
    let submitted = submissions
        .submit_input(&small(64), &alice())
        .await
        .expect("submit");

    poll_once(&h.worker).await;
    assert_eq!(
        status_of(&h, &submitted.fingerprint).await,
        Some(JobStatus::TooComplex)
    );
    assert_eq!(h.artifacts.put_count(), 0);
    assert!(h.queue.is_empty());

    let again = submissions
        .submit_input(&small(64), &bob())
        .await
        .expect("resubmit");
    assert_eq!(again.status, JobStatus::TooComplex);
    assert_eq!(again.message, "Fractal is too complex to generate.");
    assert!(!again.queued);
    assert!(h.queue.is_empty());

    let report = h
        .ctx
        .status_resolver()
        .query(&submitted.fingerprint, &alice())
        .await
        .expect("status");
    assert_eq!(report.status, Some(JobStatus::TooComplex));
    assert!(report.artifact_url.is_none());
}

#[tokio::test]
async fn redelivered_message_does_not_recompute() {
    let h = harness();
    let submitted = h
        .ctx
        .submissions()
        .submit_input(&small(28), &alice())
        .await
        .expect("submit");
    poll_once(&h.worker).await;
    let job = h
        .ctx
        .ledger
        .find(&submitted.fingerprint)
        .await
        .expect("read")
        .expect("job exists");

    let duplicate = ReceivedMessage {
        message_id: "dup".to_string(),
        receipt_handle: "dup-receipt".to_string(),
        body: serde_json::to_string(&QueueMessage {
            request: job.request,
            fingerprint: job.fingerprint.clone(),
            requester: bob(),
            job_id: job.id,
        })
        .expect("encode"),
        receive_count: 2,
    };

    let disposition = process_message(&h.worker, &duplicate).await;
    assert_eq!(disposition, MessageDisposition::AlreadySettled);
    assert!(disposition.acknowledges());
    assert_eq!(h.artifacts.put_count(), 1);

    // The redelivery still makes the render visible to the requester it carried.
    let page = h
        .ctx
        .galleries()
        .list_gallery(&bob(), false, GalleryQuery::default())
        .await
        .expect("gallery lists");
    assert_eq!(page.total_count, 1);
}

#[tokio::test]
async fn pending_job_expires_after_ten_seconds() {
    let h = harness();
    let submitted = h
        .ctx
        .submissions()
        .submit_input(&small(30), &alice())
        .await
        .expect("submit");
    let resolver = h.ctx.status_resolver();

    h.clock.advance(time::Duration::seconds(10));
    let report = resolver.query(&submitted.fingerprint, &alice()).await.expect("status");
    assert_eq!(report.status, Some(JobStatus::Pending));

    h.clock.advance(time::Duration::seconds(1));
    let report = resolver.query(&submitted.fingerprint, &alice()).await.expect("status");
    assert_eq!(report.status, Some(JobStatus::Failed));
    assert_eq!(report.retry_count, 1);
    assert_eq!(
        report.message,
        "Fractal generation stuck in queue. Please try again later."
    );

    let history = h
        .ctx
        .galleries()
        .list_history(&alice(), false, 5, 0)
        .await
        .expect("history lists");
    assert_eq!(history.items[0].status, JobStatus::Failed);
}

#[tokio::test]
async fn generating_job_expires_after_three_minutes() {
    let h = harness();
    let submitted = h
        .ctx
        .submissions()
        .submit_input(&small(26), &alice())
        .await
        .expect("submit");
    // A worker claims the job and then disappears.
    assert!(h.ctx.ledger.claim(&submitted.fingerprint).await.expect("claim").is_applied());
    let resolver = h.ctx.status_resolver();

    h.clock.advance(time::Duration::minutes(2));
    let report = resolver.query(&submitted.fingerprint, &alice()).await.expect("status");
    assert_eq!(report.status, Some(JobStatus::Generating));
    assert_eq!(report.message, "Fractal is currently being generated.");

    h.clock.advance(time::Duration::seconds(61));
    let report = resolver.query(&submitted.fingerprint, &alice()).await.expect("status");
    assert_eq!(report.status, Some(JobStatus::Failed));
    assert_eq!(report.retry_count, 1);
    assert_eq!(report.message, "Worker crashed. Retrying soon...");
}

#[tokio::test]
async fn sweep_expires_stuck_jobs_without_a_poll() {
    let h = harness();
    let submissions = h.ctx.submissions();
    let stuck = submissions.submit_input(&small(20), &alice()).await.expect("submit");
    h.clock.advance(time::Duration::seconds(30));
    let fresh = submissions.submit_input(&small(22), &alice()).await.expect("submit");

    let summary = h.ctx.status_resolver().sweep(100).await.expect("sweep");
    assert_eq!(summary.examined, 2);
    assert_eq!(summary.expired, 1);
    assert_eq!(status_of(&h, &stuck.fingerprint).await, Some(JobStatus::Failed));
    assert_eq!(status_of(&h, &fresh.fingerprint).await, Some(JobStatus::Pending));
}

#[tokio::test]
async fn failed_job_can_be_resubmitted() {
    let h = harness();
    let submissions = h.ctx.submissions();
    let submitted = submissions.submit_input(&small(34), &alice()).await.expect("submit");
    h.clock.advance(time::Duration::seconds(11));
    h.ctx.status_resolver().sweep(100).await.expect("sweep");

    let plain = submissions.submit_input(&small(34), &alice()).await.expect("submit");
    assert_eq!(plain.status, JobStatus::Failed);
    assert!(!plain.queued);

    let requeued = submissions
        .resubmit(&submitted.fingerprint, &alice())
        .await
        .expect("resubmit");
    assert!(requeued.queued);
    assert_eq!(requeued.status, JobStatus::Pending);

    // The original delivery and the requeued one: one renders, the other finds it settled.
    while poll_once(&h.worker).await > 0 {}
    assert_eq!(status_of(&h, &submitted.fingerprint).await, Some(JobStatus::Complete));
    assert_eq!(h.artifacts.put_count(), 1);

    let report = h
        .ctx
        .status_resolver()
        .query(&submitted.fingerprint, &alice())
        .await
        .expect("status");
    assert_eq!(report.retry_count, 1);
    assert_eq!(report.message, "Fractal generation complete.");
}

#[tokio::test]
async fn resubmitting_an_unknown_fingerprint_is_not_found() {
    let h = harness();
    let fingerprint = Fingerprint::of(&RenderRequest::default());

    let err = h
        .ctx
        .submissions()
        .resubmit(&fingerprint, &alice())
        .await
        .expect_err("nothing to requeue");
    assert!(matches!(err, AppError::NotFound));
}

#[tokio::test]
async fn enqueue_failure_fails_the_job() {
    let h = harness();
    h.queue.set_fail_sends(true);

    let err = h
        .ctx
        .submissions()
        .submit_input(&small(38), &alice())
        .await
        .expect_err("send fails");
    assert!(matches!(err, AppError::Queue(QueueError::Backend(_))));

    let fingerprint = Fingerprint::of(&small(38).resolve().expect("valid"));
    assert_eq!(status_of(&h, &fingerprint).await, Some(JobStatus::Failed));

    h.queue.set_fail_sends(false);
    let requeued = h
        .ctx
        .submissions()
        .resubmit(&fingerprint, &alice())
        .await
        .expect("resubmit");
    assert!(requeued.queued);
    assert_eq!(h.queue.len(), 1);
}

#[tokio::test]
async fn deleting_the_last_reference_reclaims_the_fractal() {
    let h = harness();
    let submissions = h.ctx.submissions();
    let submitted = submissions.submit_input(&small(42), &alice()).await.expect("submit");
    poll_once(&h.worker).await;
    submissions.submit_input(&small(42), &bob()).await.expect("submit");

    let galleries = h.ctx.galleries();
    let alice_entry = galleries
        .list_gallery(&alice(), false, GalleryQuery::default())
        .await
        .expect("list")
        .items[0]
        .entry
        .id;
    let bob_entry = galleries
        .list_gallery(&bob(), false, GalleryQuery::default())
        .await
        .expect("list")
        .items[0]
        .entry
        .id;

    let err = galleries
        .delete_entry(&bob(), alice_entry)
        .await
        .expect_err("not the owner");
    assert!(matches!(err, AppError::Identity(IdentityError::Forbidden)));

    let outcome = galleries.delete_entry(&alice(), alice_entry).await.expect("delete");
    assert_eq!(outcome, DeleteOutcome::EntryRemoved);
    assert!(h.artifacts.contains(&submitted.fingerprint.artifact_key()));
    assert_eq!(h.repos.job_count(), 1);

    let outcome = galleries.delete_entry(&admin(), bob_entry).await.expect("delete");
    assert_eq!(outcome, DeleteOutcome::FractalReclaimed);
    assert!(h.artifacts.is_empty());
    assert_eq!(h.repos.job_count(), 0);

    let report = h
        .ctx
        .status_resolver()
        .query(&submitted.fingerprint, &alice())
        .await
        .expect("status");
    assert_eq!(report.status, None);

    let history = galleries
        .list_history(&alice(), false, 5, 0)
        .await
        .expect("history");
    assert_eq!(history.total_count, 1);
    assert!(history.items[0].fractal_deleted());
}

/// Ledger whose deletes always time out.
struct UndeletableLedger(Arc<MemoryRepositories>);

#[async_trait]
impl LedgerRepo for UndeletableLedger {
    async fn insert_job(&self, job: NewJobRecord) -> Result<JobRecord, RepoError> {
        self.0.insert_job(job).await
    }

    async fn find_job(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, RepoError> {
        self.0.find_job(fingerprint).await
    }

    async fn transition_job(
        &self,
        params: TransitionJobParams,
    ) -> Result<Option<JobRecord>, RepoError> {
        self.0.transition_job(params).await
    }

    async fn delete_job(&self, _fingerprint: &Fingerprint) -> Result<bool, RepoError> {
        Err(RepoError::Timeout)
    }

    async fn list_jobs_in(
        &self,
        statuses: &[JobStatus],
        limit: u32,
    ) -> Result<Vec<JobRecord>, RepoError> {
        self.0.list_jobs_in(statuses, limit).await
    }
}

#[tokio::test]
async fn failed_job_row_delete_keeps_the_artifact() {
    let mut h = harness();
    h.ctx.ledger = JobLedger::new(
        Arc::new(UndeletableLedger(h.repos.clone())),
        h.clock.clone(),
    );
    h.worker = WorkerContext::new(
        h.ctx.clone(),
        WorkerOptions {
            receive_wait: Duration::ZERO,
            ..WorkerOptions::default()
        },
    );

    let submissions = h.ctx.submissions();
    let submitted = submissions.submit_input(&small(43), &alice()).await.expect("submit");
    poll_once(&h.worker).await;
    let key = submitted.fingerprint.artifact_key();
    assert!(h.artifacts.contains(&key));

    let galleries = h.ctx.galleries();
    let entry = galleries
        .list_gallery(&alice(), false, GalleryQuery::default())
        .await
        .expect("list")
        .items[0]
        .entry
        .id;
    let err = galleries
        .delete_entry(&alice(), entry)
        .await
        .expect_err("job row delete fails");
    assert!(matches!(err, AppError::Repo(RepoError::Timeout)));

    // The job still claims the artifact, so the artifact must still be there.
    assert_eq!(
        status_of(&h, &submitted.fingerprint).await,
        Some(JobStatus::Complete)
    );
    assert!(h.artifacts.contains(&key));

    let again = submissions.submit_input(&small(43), &bob()).await.expect("submit");
    assert_eq!(again.status, JobStatus::Complete);
    assert!(again.artifact_url.is_some());
    assert!(!again.queued);
}

#[tokio::test(start_paused = true)]
async fn storage_failure_is_redelivered_and_completes() {
    let h = harness();
    let submitted = h
        .ctx
        .submissions()
        .submit_input(&small(44), &alice())
        .await
        .expect("submit");

    h.artifacts.set_fail_puts(true);
    assert_eq!(poll_once(&h.worker).await, 1);
    let job = h
        .ctx
        .ledger
        .find(&submitted.fingerprint)
        .await
        .expect("read")
        .expect("job exists");
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 1);
    assert!(job.artifact_key.is_none());
    assert_eq!(h.queue.len(), 1, "message stays for redelivery");

    // Hidden until the visibility timeout lapses.
    assert_eq!(poll_once(&h.worker).await, 0);

    h.artifacts.set_fail_puts(false);
    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(poll_once(&h.worker).await, 1);

    let job = h
        .ctx
        .ledger
        .find(&submitted.fingerprint)
        .await
        .expect("read")
        .expect("job exists");
    assert_eq!(job.status, JobStatus::Complete);
    assert_eq!(job.retry_count, 1);
    assert!(h.artifacts.contains(&submitted.fingerprint.artifact_key()));
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn global_views_are_admin_only() {
    let h = harness();
    let submissions = h.ctx.submissions();
    submissions.submit_input(&small(44), &alice()).await.expect("submit");
    submissions.submit_input(&small(46), &bob()).await.expect("submit");
    while poll_once(&h.worker).await > 0 {}

    let galleries = h.ctx.galleries();
    let err = galleries
        .list_gallery(&alice(), true, GalleryQuery::default())
        .await
        .expect_err("users cannot list everything");
    assert!(matches!(err, AppError::Identity(IdentityError::Forbidden)));

    let all = galleries
        .list_gallery(&admin(), true, GalleryQuery::default())
        .await
        .expect("admin lists");
    assert_eq!(all.total_count, 2);

    let history = galleries
        .list_history(&admin(), true, 5, 0)
        .await
        .expect("admin history");
    assert_eq!(history.total_count, 2);
}

#[tokio::test]
async fn undecodable_message_is_discarded() {
    let h = harness();
    h.queue.push_raw("{not json");

    assert_eq!(poll_once(&h.worker).await, 1);
    assert!(h.queue.is_empty());
}

#[tokio::test]
async fn message_past_delivery_limit_fails_the_job() {
    let h = harness();
    let submitted = h
        .ctx
        .submissions()
        .submit_input(&small(50), &alice())
        .await
        .expect("submit");
    let job = h
        .ctx
        .ledger
        .find(&submitted.fingerprint)
        .await
        .expect("read")
        .expect("job exists");

    let exhausted = ReceivedMessage {
        message_id: "m-1".to_string(),
        receipt_handle: "r-1".to_string(),
        body: serde_json::to_string(&QueueMessage {
            request: job.request,
            fingerprint: job.fingerprint.clone(),
            requester: alice(),
            job_id: job.id,
        })
        .expect("encode"),
        receive_count: WorkerOptions::default().max_receive_count + 1,
    };

    let disposition = process_message(&h.worker, &exhausted).await;
    assert_eq!(disposition, MessageDisposition::DeadLettered);
    assert_eq!(status_of(&h, &submitted.fingerprint).await, Some(JobStatus::Failed));
    assert_eq!(h.artifacts.put_count(), 0);
}

#[tokio::test]
async fn invalid_parameters_never_reach_the_ledger() {
    let h = harness();
    let err = h
        .ctx
        .submissions()
        .submit_input(
            &RenderRequestInput {
                width: Some(0),
                ..RenderRequestInput::default()
            },
            &alice(),
        )
        .await
        .expect_err("zero width rejected");

    assert!(err.is_client_error());
    assert_eq!(h.repos.job_count(), 0);
    assert!(h.queue.is_empty());
}
