mod context;
mod queue;
mod sweeper;
mod worker;

pub use context::{
    DEFAULT_IDLE_BACKOFF, DEFAULT_MAX_RECEIVE_COUNT, DEFAULT_RECEIVE_BATCH, DEFAULT_RECEIVE_WAIT,
    WorkerContext, WorkerOptions,
};
pub use queue::{enqueue_render, wait_for_settled};
pub use sweeper::{DEFAULT_SWEEP_INTERVAL, DEFAULT_SWEEP_LIMIT, run_sweeper};
pub use worker::{MessageDisposition, poll_once, process_message, run_worker, spawn_workers};
