//! Error types for provisioning runs.
//!
//! Registry and plan errors are fatal and surface before anything touches
//! the machine. Backend errors stay local to one step. State store errors
//! abort the run because resumability can no longer be guaranteed.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building the step registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("duplicate step id: {0}")]
    DuplicateId(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },
}

/// Errors raised while computing a plan
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// Ids on one dependency cycle, each depending on the next and the last on the first
    #[error("dependency cycle detected: {}", format_cycle(.0))]
    CycleDetected(Vec<String>),

    #[error("unknown step: {0}")]
    UnknownStep(String),
}

fn format_cycle(ids: &[String]) -> String {
    let mut parts: Vec<&str> = ids.iter().map(String::as_str).collect();
    if let Some(first) = ids.first() {
        parts.push(first);
    }
    parts.join(" -> ")
}

/// Categories of backend failures for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network, rate limiting, lock contention: worth retrying
    Transient,
    /// Misconfiguration, missing package, permission denied
    Permanent,
    /// The step exceeded its time budget
    Timeout,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Transient => "Transient failure",
            Self::Permanent => "Permanent failure",
            Self::Timeout => "Timed out",
        }
    }
}

/// Failure reported by an installer backend (or the watchdog around it)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Permanent(String),

    #[error("timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Transient(_) => ErrorCategory::Transient,
            Self::Permanent(_) => ErrorCategory::Permanent,
            Self::Timeout(_) => ErrorCategory::Timeout,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

/// Failure to read or persist run state
#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode state: {0}")]
    Encode(String),

    #[error("failed to decode state file {path}: {message}")]
    Decode { path: PathBuf, message: String },
}

impl StateStoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure to take the exclusive run lock
#[derive(Debug, Error)]
pub enum LockError {
    #[error("another provisioning run holds the lock at {0}")]
    Busy(PathBuf),

    #[error("failed to open lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Fatal error that aborts a run
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("failed to record result of step '{step}': {source}")]
    State {
        step: String,
        #[source]
        source: StateStoreError,
    },
}
