//! Status queries and the staleness guards behind them.
//!
//! Workers that die mid-job leave rows in `pending` or `generating` forever; the only thing that
//! notices is a guard evaluated here, either on a client poll or from the periodic sweep.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    application::{
        error::AppError,
        ledger::{JobLedger, TransitionOutcome},
        ports::ArtifactStore,
        repos::HistoryRepo,
    },
    domain::{
        entities::{JobRecord, Requester},
        fingerprint::Fingerprint,
        lifecycle::{StaleReason, StalenessPolicy},
        types::JobStatus,
    },
};

const SOURCE: &str = "application::status";
const METRIC_STALE: &str = "fractory_status_stale_total";

pub const DEFAULT_PRESIGN_TTL: Duration = Duration::from_secs(3600);

/// What a polling caller sees. `status` is `None` when no job exists for the fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub fingerprint: Fingerprint,
    pub status: Option<JobStatus>,
    pub message: String,
    pub artifact_url: Option<String>,
    pub retry_count: i32,
}

impl StatusReport {
    fn not_found(fingerprint: &Fingerprint) -> Self {
        Self {
            fingerprint: fingerprint.clone(),
            status: None,
            message: "No fractal found for this fingerprint.".to_string(),
            artifact_url: None,
            retry_count: 0,
        }
    }

    pub fn status_label(&self) -> &'static str {
        self.status.map_or("not_found", JobStatus::as_str)
    }
}

/// Human-readable message for a failed job. The first failure promises a retry; later ones do not.
pub(crate) fn failure_message(retry_count: i32, stale: Option<StaleReason>) -> &'static str {
    let first = retry_count <= 1;
    match stale {
        Some(StaleReason::StuckInQueue) => {
            "Fractal generation stuck in queue. Please try again later."
        }
        Some(StaleReason::WorkerLost) if first => "Worker crashed. Retrying soon...",
        Some(StaleReason::WorkerLost) => {
            "Worker crashed after multiple attempts. Please try again later."
        }
        None if first => "Generation failed. Retrying soon...",
        None => "Generation failed after multiple attempts. Please try again later.",
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub examined: usize,
    pub expired: usize,
}

#[derive(Clone)]
pub struct StatusResolver {
    ledger: JobLedger,
    history: Arc<dyn HistoryRepo>,
    artifacts: Arc<dyn ArtifactStore>,
    policy: StalenessPolicy,
    presign_ttl: Duration,
}

impl StatusResolver {
    pub fn new(
        ledger: JobLedger,
        history: Arc<dyn HistoryRepo>,
        artifacts: Arc<dyn ArtifactStore>,
        policy: StalenessPolicy,
        presign_ttl: Duration,
    ) -> Self {
        Self {
            ledger,
            history,
            artifacts,
            policy,
            presign_ttl,
        }
    }

    pub fn policy(&self) -> StalenessPolicy {
        self.policy
    }

    pub async fn query(
        &self,
        fingerprint: &Fingerprint,
        requester: &Requester,
    ) -> Result<StatusReport, AppError> {
        let Some(job) = self.ledger.find(fingerprint).await? else {
            info!(
                target = SOURCE,
                fingerprint = %fingerprint,
                requester_id = %requester.id,
                "status query for unknown fingerprint"
            );
            return Ok(StatusReport::not_found(fingerprint));
        };

        match self.apply_guard(job).await? {
            Some((job, stale)) => self.report(&job, stale).await,
            None => Ok(StatusReport::not_found(fingerprint)),
        }
    }

    /// Apply the staleness guards to every open job, oldest first, up to `limit` rows.
    pub async fn sweep(&self, limit: u32) -> Result<SweepSummary, AppError> {
        let open = self
            .ledger
            .list_in(&[JobStatus::Pending, JobStatus::Generating], limit)
            .await?;

        let mut summary = SweepSummary {
            examined: open.len(),
            expired: 0,
        };
        for job in open {
            if let Some((_, Some(_))) = self.apply_guard(job).await? {
                summary.expired += 1;
            }
        }

        if summary.expired > 0 {
            info!(
                target = SOURCE,
                examined = summary.examined,
                expired = summary.expired,
                "stale sweep expired jobs"
            );
        }
        Ok(summary)
    }

    /// Evaluate the guard for `job` and expire it if it fired. Returns the job as it now stands
    /// and the reason when this call performed the expiry; `None` if the row vanished meanwhile.
    async fn apply_guard(
        &self,
        job: JobRecord,
    ) -> Result<Option<(JobRecord, Option<StaleReason>)>, AppError> {
        let now = self.ledger.clock().now();
        let Some(reason) = self.policy.evaluate(&job, now) else {
            return Ok(Some((job, None)));
        };

        match self.ledger.expire(&job).await? {
            TransitionOutcome::Applied(expired) => {
                counter!(METRIC_STALE, "reason" => reason.as_str()).increment(1);
                warn!(
                    target = SOURCE,
                    fingerprint = %expired.fingerprint,
                    reason = reason.as_str(),
                    retry_count = expired.retry_count,
                    "stale job marked failed"
                );
                self.mirror_history(&expired).await;
                Ok(Some((expired, Some(reason))))
            }
            // Someone else moved the row first; report what they left.
            TransitionOutcome::Skipped { current } => Ok(current.map(|job| (job, None))),
        }
    }

    async fn mirror_history(&self, job: &JobRecord) {
        if let Err(err) = self
            .history
            .update_history_status(&job.fingerprint, job.status)
            .await
        {
            warn!(
                target = SOURCE,
                fingerprint = %job.fingerprint,
                error = %err,
                "failed to mirror status onto history"
            );
        }
    }

    async fn report(
        &self,
        job: &JobRecord,
        stale: Option<StaleReason>,
    ) -> Result<StatusReport, AppError> {
        let mut artifact_url = None;
        let message = match job.status {
            JobStatus::Complete => {
                if let Some(key) = job.artifact_key.as_deref() {
                    artifact_url = Some(self.artifacts.presign(key, self.presign_ttl).await?);
                }
                "Fractal generation complete."
            }
            JobStatus::Pending => "Fractal generation has been queued.",
            JobStatus::Generating => "Fractal is currently being generated.",
            JobStatus::TooComplex => "Fractal is too complex to generate.",
            JobStatus::Failed => failure_message(job.retry_count, stale),
        };

        Ok(StatusReport {
            fingerprint: job.fingerprint.clone(),
            status: Some(job.status),
            message: message.to_string(),
            artifact_url,
            retry_count: job.retry_count,
        })
    }
}
