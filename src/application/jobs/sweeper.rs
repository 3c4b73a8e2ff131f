use std::time::Duration;

use tokio::{sync::watch, time::interval};
use tracing::{info, warn};

use crate::application::status::StatusResolver;

const SOURCE: &str = "application::jobs::sweeper";

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_LIMIT: u32 = 500;

/// Periodically apply the staleness guards so stuck jobs fail without waiting for a poll.
pub async fn run_sweeper(
    resolver: StatusResolver,
    every: Duration,
    limit: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(target = SOURCE, every_secs = every.as_secs(), "stale sweeper started");
    let mut ticker = interval(every);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        if let Err(err) = resolver.sweep(limit).await {
            warn!(target = SOURCE, error = %err, "stale sweep failed");
        }
    }
    info!(target = SOURCE, "stale sweeper stopped");
}
