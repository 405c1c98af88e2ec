//! Installer backend capability interface
//!
//! One implementation per target platform. The engine only ever mutates the
//! machine through these two calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::BackendError;
use crate::types::Step;

/// Stand-in deadline for timeouts too large to represent as an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// `now + timeout`, saturating to a far deadline instead of overflowing
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

/// Per-call context handed to the backend
///
/// Carries the step deadline and an abort flag. The executor raises the
/// flag when the deadline passes; backends that spawn processes should
/// poll it and kill their children.
#[derive(Debug, Clone)]
pub struct CallContext {
    deadline: Instant,
    abort: Arc<AtomicBool>,
}

impl CallContext {
    pub fn new(deadline: Instant) -> Self {
        Self {
            deadline,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Context with no practical deadline (for direct backend use)
    pub fn unbounded() -> Self {
        Self::new(deadline_after(Duration::MAX))
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the deadline (zero once passed)
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst) || Instant::now() >= self.deadline
    }

    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// Platform capability that probes and performs steps
pub trait InstallerBackend: Send + Sync {
    /// Name shown in logs (e.g. "system/brew")
    fn name(&self) -> &str;

    /// Whether the step's desired state already holds
    fn probe(&self, step: &Step, ctx: &CallContext) -> Result<bool, BackendError>;

    /// Perform the step's action
    fn apply(&self, step: &Step, ctx: &CallContext) -> Result<(), BackendError>;
}

impl<B: InstallerBackend + ?Sized> InstallerBackend for Arc<B> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn probe(&self, step: &Step, ctx: &CallContext) -> Result<bool, BackendError> {
        (**self).probe(step, ctx)
    }

    fn apply(&self, step: &Step, ctx: &CallContext) -> Result<(), BackendError> {
        (**self).apply(step, ctx)
    }
}
