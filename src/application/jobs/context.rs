use std::time::Duration;

use crate::application::{context::PipelineContext, render::DEFAULT_MAX_RENDER_TIME};

pub const DEFAULT_RECEIVE_BATCH: usize = 1;
pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(20);
pub const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_RECEIVE_COUNT: u32 = 5;

/// Tuning for a single poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    pub max_render_time: Duration,
    pub receive_batch: usize,
    pub receive_wait: Duration,
    /// Pause after an empty or failed receive.
    pub idle_backoff: Duration,
    /// Deliveries after which a message is treated as dead-lettered.
    pub max_receive_count: u32,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_render_time: DEFAULT_MAX_RENDER_TIME,
            receive_batch: DEFAULT_RECEIVE_BATCH,
            receive_wait: DEFAULT_RECEIVE_WAIT,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
            max_receive_count: DEFAULT_MAX_RECEIVE_COUNT,
        }
    }
}

/// Shared context passed to workers so they can reach the pipeline's collaborators.
#[derive(Clone)]
pub struct WorkerContext {
    pub pipeline: PipelineContext,
    pub options: WorkerOptions,
}

impl WorkerContext {
    pub fn new(pipeline: PipelineContext, options: WorkerOptions) -> Self {
        Self { pipeline, options }
    }
}
