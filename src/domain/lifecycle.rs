//! Job state machine: legal transitions and staleness guards.
//!
//! Everything here is pure. Persistence applies a transition as a compare-and-set against the
//! source states returned by [`Transition::sources`]; the current time is always passed in so the
//! guards can be exercised without a wall clock.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use super::entities::JobRecord;
use super::types::JobStatus;

pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::seconds(10);
pub const DEFAULT_GENERATING_TIMEOUT: Duration = Duration::minutes(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// A worker takes ownership of the job. Re-claiming a `generating` job covers redelivery
    /// after the previous holder's visibility window lapsed.
    Claim,
    Complete,
    TooComplex,
    /// Worker-observed failure.
    Fail,
    /// Failure detected by a staleness guard rather than by the worker itself.
    Expire,
    /// The queue gave up on the message.
    DeadLetter,
    /// Explicit caller resubmission of a failed job.
    Requeue,
}

impl Transition {
    pub fn sources(self) -> &'static [JobStatus] {
        match self {
            Transition::Claim => &[JobStatus::Pending, JobStatus::Failed, JobStatus::Generating],
            Transition::Complete | Transition::TooComplex | Transition::Fail => {
                &[JobStatus::Generating]
            }
            Transition::Expire | Transition::DeadLetter => {
                &[JobStatus::Pending, JobStatus::Generating]
            }
            Transition::Requeue => &[JobStatus::Failed],
        }
    }

    pub fn target(self) -> JobStatus {
        match self {
            Transition::Claim => JobStatus::Generating,
            Transition::Complete => JobStatus::Complete,
            Transition::TooComplex => JobStatus::TooComplex,
            Transition::Fail | Transition::Expire | Transition::DeadLetter => JobStatus::Failed,
            Transition::Requeue => JobStatus::Pending,
        }
    }

    /// `retry_count` moves only on entry into `failed`.
    pub fn increments_retry(self) -> bool {
        self.target() == JobStatus::Failed
    }

    pub fn allowed_from(self, status: JobStatus) -> bool {
        self.sources().contains(&status)
    }
}

/// Why a staleness guard fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Nobody picked the job up from the queue in time.
    StuckInQueue,
    /// The worker holding the job stopped touching it.
    WorkerLost,
}

impl StaleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StaleReason::StuckInQueue => "stuck_in_queue",
            StaleReason::WorkerLost => "worker_lost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StalenessPolicy {
    pub pending_timeout: Duration,
    pub generating_timeout: Duration,
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self {
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            generating_timeout: DEFAULT_GENERATING_TIMEOUT,
        }
    }
}

impl StalenessPolicy {
    /// Evaluate the guard for `job` at `now`.
    ///
    /// Both guards measure from `last_updated`. For a pending job that is the time it entered the
    /// queue: `created_at` for a fresh job, or the moment of an explicit requeue, which gives the
    /// new message a full pending window instead of expiring it on arrival.
    pub fn evaluate(&self, job: &JobRecord, now: OffsetDateTime) -> Option<StaleReason> {
        match job.status {
            JobStatus::Pending if now - job.last_updated > self.pending_timeout => {
                Some(StaleReason::StuckInQueue)
            }
            JobStatus::Generating if now - job.last_updated > self.generating_timeout => {
                Some(StaleReason::WorkerLost)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;
    use uuid::Uuid;

    use super::*;
    use crate::domain::fingerprint::Fingerprint;
    use crate::domain::request::RenderRequest;

    fn job(status: JobStatus, last_updated: OffsetDateTime) -> JobRecord {
        let request = RenderRequest::default();
        JobRecord {
            id: Uuid::new_v4(),
            fingerprint: Fingerprint::of(&request),
            request,
            status,
            retry_count: 0,
            created_at: last_updated,
            last_updated,
            artifact_key: None,
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_transition() {
        let all = [
            Transition::Claim,
            Transition::Complete,
            Transition::TooComplex,
            Transition::Fail,
            Transition::Expire,
            Transition::DeadLetter,
            Transition::Requeue,
        ];
        for transition in all {
            assert!(!transition.allowed_from(JobStatus::Complete), "{transition:?}");
            assert!(!transition.allowed_from(JobStatus::TooComplex), "{transition:?}");
        }
    }

    #[test]
    fn only_failure_transitions_bump_retries() {
        assert!(Transition::Fail.increments_retry());
        assert!(Transition::Expire.increments_retry());
        assert!(Transition::DeadLetter.increments_retry());
        assert!(!Transition::Claim.increments_retry());
        assert!(!Transition::Complete.increments_retry());
        assert!(!Transition::TooComplex.increments_retry());
        assert!(!Transition::Requeue.increments_retry());
    }

    #[test]
    fn completion_requires_generating() {
        assert!(Transition::Complete.allowed_from(JobStatus::Generating));
        assert!(!Transition::Complete.allowed_from(JobStatus::Pending));
        assert!(!Transition::Complete.allowed_from(JobStatus::Failed));
    }

    #[test]
    fn pending_goes_stale_after_ten_seconds() {
        let policy = StalenessPolicy::default();
        let start = datetime!(2026-01-01 00:00:00 UTC);
        let pending = job(JobStatus::Pending, start);

        assert_eq!(policy.evaluate(&pending, start + Duration::seconds(10)), None);
        assert_eq!(
            policy.evaluate(&pending, start + Duration::seconds(11)),
            Some(StaleReason::StuckInQueue)
        );
    }

    #[test]
    fn requeued_pending_job_gets_a_fresh_window() {
        let policy = StalenessPolicy::default();
        let created = datetime!(2026-01-01 00:00:00 UTC);
        let requeued_at = created + Duration::minutes(5);
        let mut requeued = job(JobStatus::Pending, requeued_at);
        requeued.created_at = created;

        assert_eq!(policy.evaluate(&requeued, requeued_at + Duration::seconds(5)), None);
        assert_eq!(
            policy.evaluate(&requeued, requeued_at + Duration::seconds(11)),
            Some(StaleReason::StuckInQueue)
        );
    }

    #[test]
    fn generating_goes_stale_after_three_minutes() {
        let policy = StalenessPolicy::default();
        let start = datetime!(2026-01-01 00:00:00 UTC);
        let generating = job(JobStatus::Generating, start);

        assert_eq!(policy.evaluate(&generating, start + Duration::minutes(3)), None);
        assert_eq!(
            policy.evaluate(&generating, start + Duration::minutes(3) + Duration::seconds(1)),
            Some(StaleReason::WorkerLost)
        );
    }

    #[test]
    fn settled_jobs_never_go_stale() {
        let policy = StalenessPolicy::default();
        let start = datetime!(2026-01-01 00:00:00 UTC);
        let later = start + Duration::days(30);
        for status in [JobStatus::Complete, JobStatus::TooComplex, JobStatus::Failed] {
            assert_eq!(policy.evaluate(&job(status, start), later), None);
        }
    }
}
