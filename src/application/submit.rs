//! Render submission: fingerprint, deduplicate against the ledger, enqueue.

use serde::Serialize;
use tracing::{error, info, warn};

use crate::{
    application::{
        context::PipelineContext,
        error::AppError,
        gallery::attach_completed,
        jobs::enqueue_render,
        ledger::{CreateOutcome, TransitionOutcome},
        ports::QueueMessage,
        status::failure_message,
    },
    domain::{
        entities::{JobRecord, Requester},
        fingerprint::Fingerprint,
        request::{RenderRequest, RenderRequestInput},
        types::JobStatus,
    },
};

const SOURCE: &str = "application::submit";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionOutcome {
    pub fingerprint: Fingerprint,
    pub status: JobStatus,
    pub message: String,
    pub artifact_url: Option<String>,
    /// True only when this call put a message on the queue.
    pub queued: bool,
}

#[derive(Clone)]
pub struct SubmissionService {
    ctx: PipelineContext,
}

impl SubmissionService {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub async fn submit_input(
        &self,
        input: &RenderRequestInput,
        requester: &Requester,
    ) -> Result<SubmissionOutcome, AppError> {
        let request = input.resolve()?;
        self.submit(request, requester).await
    }

    /// Submit `request` on behalf of `requester`.
    ///
    /// A fingerprint seen before is never rendered again: the caller gets the existing job's
    /// status, and a completed artifact is attached to their gallery.
    pub async fn submit(
        &self,
        request: RenderRequest,
        requester: &Requester,
    ) -> Result<SubmissionOutcome, AppError> {
        request.validate()?;
        let fingerprint = Fingerprint::of(&request);
        info!(
            target = SOURCE,
            fingerprint = %fingerprint,
            requester_id = %requester.id,
            "render submission received"
        );

        if let Some(job) = self.ctx.ledger.find(&fingerprint).await? {
            return self.existing(job, requester).await;
        }

        match self.ctx.ledger.create(&fingerprint, &request).await? {
            CreateOutcome::Created(job) => self.enqueue_new(job, requester).await,
            CreateOutcome::Existing(job) => self.existing(job, requester).await,
        }
    }

    /// Explicitly put a failed job back on the queue. Jobs in any other state report their
    /// current status unchanged.
    pub async fn resubmit(
        &self,
        fingerprint: &Fingerprint,
        requester: &Requester,
    ) -> Result<SubmissionOutcome, AppError> {
        match self.ctx.ledger.requeue(fingerprint).await? {
            TransitionOutcome::Applied(job) => {
                info!(
                    target = SOURCE,
                    fingerprint = %fingerprint,
                    retry_count = job.retry_count,
                    "failed job requeued"
                );
                self.ctx
                    .history
                    .update_history_status(fingerprint, JobStatus::Pending)
                    .await?;
                self.enqueue_new(job, requester).await
            }
            TransitionOutcome::Skipped { current: Some(job) } => {
                self.existing(job, requester).await
            }
            TransitionOutcome::Skipped { current: None } => Err(AppError::NotFound),
        }
    }

    async fn enqueue_new(
        &self,
        job: JobRecord,
        requester: &Requester,
    ) -> Result<SubmissionOutcome, AppError> {
        let now = self.ctx.ledger.clock().now();
        self.ctx
            .history
            .record_history(requester, &job.fingerprint, JobStatus::Pending, now)
            .await?;
        self.ctx.read_cache.invalidate_for_requester(&requester.id).await;

        let message = QueueMessage {
            request: job.request,
            fingerprint: job.fingerprint.clone(),
            requester: requester.clone(),
            job_id: job.id,
        };

        match enqueue_render(self.ctx.queue.as_ref(), &message).await {
            Ok(message_id) => {
                info!(
                    target = SOURCE,
                    fingerprint = %job.fingerprint,
                    message_id = %message_id,
                    "render queued"
                );
                Ok(SubmissionOutcome {
                    fingerprint: job.fingerprint,
                    status: JobStatus::Pending,
                    message: "Fractal generation has been queued.".to_string(),
                    artifact_url: None,
                    queued: true,
                })
            }
            Err(err) => {
                error!(
                    target = SOURCE,
                    fingerprint = %job.fingerprint,
                    error = %err,
                    "failed to enqueue render"
                );
                // The job never reached a worker; fail it so the next submission can requeue.
                if let TransitionOutcome::Applied(failed) = self.ctx.ledger.expire(&job).await?
                    && let Err(mirror_err) = self
                        .ctx
                        .history
                        .update_history_status(&failed.fingerprint, failed.status)
                        .await
                {
                    warn!(
                        target = SOURCE,
                        fingerprint = %failed.fingerprint,
                        error = %mirror_err,
                        "failed to mirror status onto history"
                    );
                }
                Err(err.into())
            }
        }
    }

    async fn existing(
        &self,
        job: JobRecord,
        requester: &Requester,
    ) -> Result<SubmissionOutcome, AppError> {
        let now = self.ctx.ledger.clock().now();
        if job.status != JobStatus::Complete {
            self.ctx
                .history
                .record_history(requester, &job.fingerprint, job.status, now)
                .await?;
            self.ctx.read_cache.invalidate_for_requester(&requester.id).await;
        }

        // The worker attaches every recorded requester when it completes. If it finished between
        // our read and the history write above it may have missed this one, so look again.
        let job = if job.status.is_terminal() {
            job
        } else {
            self.ctx
                .ledger
                .find(&job.fingerprint)
                .await?
                .ok_or(AppError::NotFound)?
        };

        let mut artifact_url = None;
        let message = match job.status {
            JobStatus::Complete => {
                attach_completed(&self.ctx, requester, &job).await?;
                if let Some(key) = job.artifact_key.as_deref() {
                    artifact_url = Some(self.ctx.artifacts.presign(key, self.ctx.presign_ttl).await?);
                }
                "Fractal already exists.".to_string()
            }
            JobStatus::TooComplex => "Fractal is too complex to generate.".to_string(),
            JobStatus::Failed => failure_message(job.retry_count, None).to_string(),
            JobStatus::Pending | JobStatus::Generating => {
                format!("Fractal is {}. Check status endpoint for updates.", job.status)
            }
        };

        info!(
            target = SOURCE,
            fingerprint = %job.fingerprint,
            status = %job.status,
            requester_id = %requester.id,
            "submission matched existing job"
        );

        Ok(SubmissionOutcome {
            fingerprint: job.fingerprint,
            status: job.status,
            message,
            artifact_url,
            queued: false,
        })
    }
}
