use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::{
    application::{
        ledger::JobLedger,
        ports::{QueueError, QueueMessage, WorkQueue},
        repos::RepoError,
    },
    domain::{entities::JobRecord, fingerprint::Fingerprint, types::JobStatus},
};

const DEFAULT_WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Enqueue a render, returning the queue-assigned message id.
pub async fn enqueue_render<Q>(queue: &Q, message: &QueueMessage) -> Result<String, QueueError>
where
    Q: WorkQueue + ?Sized,
{
    queue.send(message).await
}

/// Poll the ledger until the job leaves `pending`/`generating` or the timeout elapses, returning
/// the last snapshot seen either way.
pub async fn wait_for_settled(
    ledger: &JobLedger,
    fingerprint: &Fingerprint,
    timeout: Duration,
) -> Result<JobRecord, RepoError> {
    let deadline = Instant::now() + timeout;

    loop {
        let job = ledger.find(fingerprint).await?.ok_or(RepoError::NotFound)?;

        if job.status.is_terminal() || job.status == JobStatus::Failed {
            return Ok(job);
        }
        if Instant::now() >= deadline {
            return Ok(job);
        }

        sleep(DEFAULT_WAIT_POLL_INTERVAL).await;
    }
}
