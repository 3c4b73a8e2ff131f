//! Queue consumer: one message at a time, idempotent under redelivery.

use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    application::{
        error::AppError,
        gallery::attach_completed,
        ledger::TransitionOutcome,
        ports::{PNG_CONTENT_TYPE, QueueMessage, ReceivedMessage},
        render::{RenderOutcome, encode_png, render},
    },
    domain::{entities::JobRecord, types::JobStatus},
};

use super::context::WorkerContext;

const SOURCE: &str = "application::jobs::worker";
const METRIC_RENDER_MS: &str = "fractory_render_ms";
const METRIC_TOO_COMPLEX: &str = "fractory_render_too_complex_total";
const METRIC_MESSAGES: &str = "fractory_worker_messages_total";
const METRIC_FAILURES: &str = "fractory_worker_failures_total";

/// What became of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Rendered, stored, completed and attached.
    Completed,
    /// The job was already settled (or settled by someone else meanwhile); nothing recomputed.
    AlreadySettled,
    /// The render ran out of time; terminal.
    TooComplex,
    /// The job row no longer exists.
    Orphaned,
    /// The body could not be decoded.
    Poisoned,
    /// Delivered too many times; the job was failed.
    DeadLettered,
    /// Transient failure; left on the queue for redelivery.
    Failed,
}

impl MessageDisposition {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageDisposition::Completed => "completed",
            MessageDisposition::AlreadySettled => "already_settled",
            MessageDisposition::TooComplex => "too_complex",
            MessageDisposition::Orphaned => "orphaned",
            MessageDisposition::Poisoned => "poisoned",
            MessageDisposition::DeadLettered => "dead_lettered",
            MessageDisposition::Failed => "failed",
        }
    }

    /// Everything except a transient failure is deleted from the queue.
    pub fn acknowledges(self) -> bool {
        self != MessageDisposition::Failed
    }
}

/// Process one delivery. Never returns an error: failures are logged and reflected into the
/// ledger, and the disposition tells the caller whether to acknowledge.
pub async fn process_message(ctx: &WorkerContext, received: &ReceivedMessage) -> MessageDisposition {
    let message = match received.decode() {
        Ok(message) => message,
        Err(err) => {
            error!(
                target = SOURCE,
                message_id = %received.message_id,
                error = %err,
                "discarding undecodable queue message"
            );
            return MessageDisposition::Poisoned;
        }
    };

    let disposition = match handle(ctx, received, &message).await {
        Ok(disposition) => disposition,
        Err(err) => {
            error!(
                target = SOURCE,
                fingerprint = %message.fingerprint,
                error = %err,
                "render attempt failed"
            );
            counter!(METRIC_FAILURES).increment(1);
            record_failure(ctx, &message).await;
            MessageDisposition::Failed
        }
    };

    counter!(METRIC_MESSAGES, "disposition" => disposition.as_str()).increment(1);
    disposition
}

async fn handle(
    ctx: &WorkerContext,
    received: &ReceivedMessage,
    message: &QueueMessage,
) -> Result<MessageDisposition, AppError> {
    let pipeline = &ctx.pipeline;
    let fingerprint = &message.fingerprint;

    if received.receive_count > ctx.options.max_receive_count {
        let outcome = pipeline.ledger.fail_from_dead_letter(fingerprint).await?;
        if let TransitionOutcome::Applied(job) = &outcome {
            mirror_history(ctx, job).await;
        }
        warn!(
            target = SOURCE,
            fingerprint = %fingerprint,
            receive_count = received.receive_count,
            applied = outcome.is_applied(),
            "message exceeded delivery limit"
        );
        return Ok(MessageDisposition::DeadLettered);
    }

    let Some(existing) = pipeline.ledger.find(fingerprint).await? else {
        warn!(target = SOURCE, fingerprint = %fingerprint, "job row missing; dropping message");
        return Ok(MessageDisposition::Orphaned);
    };
    if existing.status.is_terminal() {
        return settled(ctx, message, &existing).await;
    }

    let job = match pipeline.ledger.claim(fingerprint).await? {
        TransitionOutcome::Applied(job) => job,
        TransitionOutcome::Skipped { current: Some(job) } => {
            return settled(ctx, message, &job).await;
        }
        TransitionOutcome::Skipped { current: None } => return Ok(MessageDisposition::Orphaned),
    };
    mirror_history(ctx, &job).await;
    info!(
        target = SOURCE,
        fingerprint = %fingerprint,
        retry_count = job.retry_count,
        width = job.request.width,
        height = job.request.height,
        max_iterations = job.request.max_iterations,
        "render started"
    );

    let started = Instant::now();
    let outcome = render(&job.request, ctx.options.max_render_time).await;
    histogram!(METRIC_RENDER_MS).record(started.elapsed().as_secs_f64() * 1000.0);

    let raster = match outcome {
        RenderOutcome::Complete(raster) => raster,
        RenderOutcome::TooComplex { elapsed, rows_done } => {
            counter!(METRIC_TOO_COMPLEX).increment(1);
            warn!(
                target = SOURCE,
                fingerprint = %fingerprint,
                elapsed_ms = elapsed.as_millis() as u64,
                rows_done,
                "render exceeded time budget"
            );
            if let TransitionOutcome::Applied(job) =
                pipeline.ledger.mark_too_complex(fingerprint).await?
            {
                mirror_history(ctx, &job).await;
            }
            return Ok(MessageDisposition::TooComplex);
        }
    };

    let png = encode_png(&raster).map_err(|err| AppError::unexpected(err.to_string()))?;
    let key = fingerprint.artifact_key();
    pipeline
        .artifacts
        .put(&key, Bytes::from(png), PNG_CONTENT_TYPE)
        .await?;

    match pipeline.ledger.complete(fingerprint, key).await? {
        TransitionOutcome::Applied(job) => {
            attach_all(ctx, message, &job).await?;
            info!(
                target = SOURCE,
                fingerprint = %fingerprint,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "render complete"
            );
            Ok(MessageDisposition::Completed)
        }
        TransitionOutcome::Skipped { current } => {
            // A staleness guard or a concurrent attempt moved the row while we rendered.
            warn!(
                target = SOURCE,
                fingerprint = %fingerprint,
                current = ?current.as_ref().map(|job| job.status),
                "completion lost the race"
            );
            Ok(MessageDisposition::AlreadySettled)
        }
    }
}

/// Redelivery of a settled job: acknowledge without recomputing, making sure the requester of a
/// completed render can see it.
async fn settled(
    ctx: &WorkerContext,
    message: &QueueMessage,
    job: &JobRecord,
) -> Result<MessageDisposition, AppError> {
    debug!(
        target = SOURCE,
        fingerprint = %job.fingerprint,
        status = %job.status,
        "job already settled; skipping render"
    );
    if job.status == JobStatus::Complete {
        attach_completed(&ctx.pipeline, &message.requester, job).await?;
    }
    Ok(MessageDisposition::AlreadySettled)
}

/// Attach the completed job to everyone who asked for it, not just the message's requester.
async fn attach_all(
    ctx: &WorkerContext,
    message: &QueueMessage,
    job: &JobRecord,
) -> Result<(), AppError> {
    let pipeline = &ctx.pipeline;
    pipeline
        .history
        .update_history_status(&job.fingerprint, JobStatus::Complete)
        .await?;

    let mut requesters = pipeline.history.requesters_for(&job.fingerprint).await?;
    if !requesters.iter().any(|r| r.id == message.requester.id) {
        requesters.push(message.requester.clone());
    }
    for requester in &requesters {
        attach_completed(pipeline, requester, job).await?;
    }
    Ok(())
}

async fn record_failure(ctx: &WorkerContext, message: &QueueMessage) {
    match ctx.pipeline.ledger.mark_failed(&message.fingerprint).await {
        Ok(TransitionOutcome::Applied(job)) => mirror_history(ctx, &job).await,
        Ok(TransitionOutcome::Skipped { .. }) => {}
        Err(err) => error!(
            target = SOURCE,
            fingerprint = %message.fingerprint,
            error = %err,
            "failed to record render failure"
        ),
    }
}

async fn mirror_history(ctx: &WorkerContext, job: &JobRecord) {
    if let Err(err) = ctx
        .pipeline
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

/// Receive and process one batch. Returns how many deliveries were handled.
pub async fn poll_once(ctx: &WorkerContext) -> usize {
    let queue = &ctx.pipeline.queue;
    let batch = match queue
        .receive(ctx.options.receive_batch, ctx.options.receive_wait)
        .await
    {
        Ok(batch) => batch,
        Err(err) => {
            warn!(target = SOURCE, error = %err, "queue receive failed");
            return 0;
        }
    };

    for received in &batch {
        let disposition = process_message(ctx, received).await;
        if disposition.acknowledges()
            && let Err(err) = queue.delete(&received.receipt_handle).await
        {
            warn!(
                target = SOURCE,
                message_id = %received.message_id,
                error = %err,
                "failed to acknowledge message"
            );
        }
    }
    batch.len()
}

/// Poll until `shutdown` flips to true. The batch in hand is always finished first.
pub async fn run_worker(ctx: WorkerContext, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
    info!(target = SOURCE, worker_id, "worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }
        let handled = poll_once(&ctx).await;
        if handled == 0 {
            tokio::select! {
                _ = sleep(ctx.options.idle_backoff) => {}
                _ = shutdown.changed() => break,
            }
        }
    }
    info!(target = SOURCE, worker_id, "worker stopped");
}

/// Spawn `concurrency` independent poll loops sharing one context.
pub fn spawn_workers(
    ctx: &WorkerContext,
    concurrency: usize,
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency.max(1))
        .map(|worker_id| tokio::spawn(run_worker(ctx.clone(), worker_id, shutdown.clone())))
        .collect()
}
