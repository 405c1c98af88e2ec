//! Progress and cancellation hooks
//!
//! These keep the engine free of any terminal UI or signal handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::BackendError;
use crate::types::{Step, StepResult};

/// Progress callback for execution
pub trait ProgressCallback {
    /// Called once before the first step
    fn on_run_start(&mut self, _run_id: &str, _total: usize) {}

    /// Called when a step is attempted (1-indexed position)
    fn on_step_start(&mut self, index: usize, total: usize, step: &Step);

    /// Called before sleeping ahead of a retry
    fn on_retry(
        &mut self,
        _step: &Step,
        _attempt: u32,
        _max_attempts: u32,
        _error: &BackendError,
        _delay: Duration,
    ) {
    }

    /// Called after a step's result has been persisted
    fn on_step_complete(&mut self, step: &Step, result: &StepResult);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_step_start(&mut self, _index: usize, _total: usize, _step: &Step) {}
    fn on_step_complete(&mut self, _step: &Step, _result: &StepResult) {}
}

/// Cooperative cancellation flag, checked between steps
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
