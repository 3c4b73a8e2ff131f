//! Job ledger: the only writer of job rows.
//!
//! Every state change goes through [`JobLedger::apply`], which issues a compare-and-set against
//! the transition's legal source states. Losing the race is not an error: the caller receives
//! [`TransitionOutcome::Skipped`] with the row as it now stands.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    application::{
        clock::Clock,
        repos::{LedgerRepo, NewJobRecord, RepoError, TransitionJobParams},
    },
    domain::{
        entities::JobRecord, fingerprint::Fingerprint, lifecycle::Transition,
        request::RenderRequest, types::JobStatus,
    },
};

const SOURCE: &str = "application::ledger";

/// Result of an idempotent create.
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    Created(JobRecord),
    /// Someone else holds the fingerprint; this is their row.
    Existing(JobRecord),
}

impl CreateOutcome {
    pub fn job(&self) -> &JobRecord {
        match self {
            CreateOutcome::Created(job) | CreateOutcome::Existing(job) => job,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(JobRecord),
    /// The row was missing or no longer in a source state.
    Skipped { current: Option<JobRecord> },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    /// The job as it stands after the attempt, if it still exists.
    pub fn job(&self) -> Option<&JobRecord> {
        match self {
            TransitionOutcome::Applied(job) => Some(job),
            TransitionOutcome::Skipped { current } => current.as_ref(),
        }
    }
}

#[derive(Clone)]
pub struct JobLedger {
    repo: Arc<dyn LedgerRepo>,
    clock: Arc<dyn Clock>,
}

impl JobLedger {
    pub fn new(repo: Arc<dyn LedgerRepo>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub async fn find(&self, fingerprint: &Fingerprint) -> Result<Option<JobRecord>, RepoError> {
        self.repo.find_job(fingerprint).await
    }

    /// Create the `pending` row for `fingerprint`. The unique constraint on fingerprint decides
    /// races; the loser receives the winner's row.
    pub async fn create(
        &self,
        fingerprint: &Fingerprint,
        request: &RenderRequest,
    ) -> Result<CreateOutcome, RepoError> {
        let record = NewJobRecord {
            id: Uuid::new_v4(),
            fingerprint: fingerprint.clone(),
            request: *request,
            created_at: self.clock.now(),
        };

        match self.repo.insert_job(record).await {
            Ok(job) => {
                info!(
                    target = SOURCE,
                    fingerprint = %fingerprint,
                    job_id = %job.id,
                    "job created"
                );
                Ok(CreateOutcome::Created(job))
            }
            Err(RepoError::Duplicate { constraint }) => {
                debug!(
                    target = SOURCE,
                    fingerprint = %fingerprint,
                    constraint = %constraint,
                    "fingerprint already recorded; using existing job"
                );
                self.repo
                    .find_job(fingerprint)
                    .await?
                    .map(CreateOutcome::Existing)
                    .ok_or(RepoError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn claim(&self, fingerprint: &Fingerprint) -> Result<TransitionOutcome, RepoError> {
        self.apply(fingerprint, Transition::Claim, None, None).await
    }

    /// `generating -> complete`, attaching the artifact in the same write.
    pub async fn complete(
        &self,
        fingerprint: &Fingerprint,
        artifact_key: String,
    ) -> Result<TransitionOutcome, RepoError> {
        self.apply(fingerprint, Transition::Complete, Some(artifact_key), None)
            .await
    }

    pub async fn mark_too_complex(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<TransitionOutcome, RepoError> {
        self.apply(fingerprint, Transition::TooComplex, None, None)
            .await
    }

    pub async fn mark_failed(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<TransitionOutcome, RepoError> {
        self.apply(fingerprint, Transition::Fail, None, None).await
    }

    /// Fail a job a staleness guard fired on. The write only lands if the row is still exactly
    /// as observed, so a concurrent claim or completion wins.
    pub async fn expire(&self, observed: &JobRecord) -> Result<TransitionOutcome, RepoError> {
        if !Transition::Expire.allowed_from(observed.status) {
            return self.skipped(&observed.fingerprint).await;
        }
        let params = TransitionJobParams {
            fingerprint: observed.fingerprint.clone(),
            from: vec![observed.status],
            to: Transition::Expire.target(),
            expected_updated_at: Some(observed.last_updated),
            increment_retry: true,
            artifact_key: None,
            at: self.clock.now(),
        };
        self.write(params, Transition::Expire).await
    }

    pub async fn fail_from_dead_letter(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<TransitionOutcome, RepoError> {
        self.apply(fingerprint, Transition::DeadLetter, None, None)
            .await
    }

    /// Explicit resubmission of a failed job.
    pub async fn requeue(&self, fingerprint: &Fingerprint) -> Result<TransitionOutcome, RepoError> {
        self.apply(fingerprint, Transition::Requeue, None, None).await
    }

    pub async fn delete(&self, fingerprint: &Fingerprint) -> Result<bool, RepoError> {
        let deleted = self.repo.delete_job(fingerprint).await?;
        if deleted {
            info!(target = SOURCE, fingerprint = %fingerprint, "job deleted");
        }
        Ok(deleted)
    }

    pub async fn list_in(
        &self,
        statuses: &[JobStatus],
        limit: u32,
    ) -> Result<Vec<JobRecord>, RepoError> {
        self.repo.list_jobs_in(statuses, limit).await
    }

    async fn apply(
        &self,
        fingerprint: &Fingerprint,
        transition: Transition,
        artifact_key: Option<String>,
        expected_updated_at: Option<time::OffsetDateTime>,
    ) -> Result<TransitionOutcome, RepoError> {
        let artifact_key = if transition == Transition::Complete {
            artifact_key
        } else {
            None
        };
        let params = TransitionJobParams {
            fingerprint: fingerprint.clone(),
            from: transition.sources().to_vec(),
            to: transition.target(),
            expected_updated_at,
            increment_retry: transition.increments_retry(),
            artifact_key,
            at: self.clock.now(),
        };
        self.write(params, transition).await
    }

    async fn write(
        &self,
        params: TransitionJobParams,
        transition: Transition,
    ) -> Result<TransitionOutcome, RepoError> {
        let fingerprint = params.fingerprint.clone();
        if params.to == JobStatus::Complete && params.artifact_key.is_none() {
            return Err(RepoError::InvalidInput {
                message: "completion requires an artifact key".to_string(),
            });
        }

        match self.repo.transition_job(params).await? {
            Some(job) => {
                debug!(
                    target = SOURCE,
                    fingerprint = %fingerprint,
                    transition = ?transition,
                    status = %job.status,
                    retry_count = job.retry_count,
                    "transition applied"
                );
                Ok(TransitionOutcome::Applied(job))
            }
            None => {
                let outcome = self.skipped(&fingerprint).await?;
                debug!(
                    target = SOURCE,
                    fingerprint = %fingerprint,
                    transition = ?transition,
                    current = ?outcome.job().map(|job| job.status),
                    "transition skipped"
                );
                Ok(outcome)
            }
        }
    }

    async fn skipped(&self, fingerprint: &Fingerprint) -> Result<TransitionOutcome, RepoError> {
        let current = self.repo.find_job(fingerprint).await?;
        Ok(TransitionOutcome::Skipped { current })
    }
}
