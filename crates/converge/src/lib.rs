//! # Converge
//!
//! A dependency-ordered, idempotent, resumable executor for provisioning plans.
//!
//! ## Core Concepts
//!
//! - **Step**: a unit of provisioning work with a check/apply action pair and dependencies
//! - **Registry**: the declarative set of steps, in registration order
//! - **Plan**: a deterministic, dependency-respecting linearization of the registry
//! - **Executor**: runs a plan sequentially, skipping satisfied steps and blocking
//!   dependents of failed ones
//! - **StateStore**: durable per-step results, so an interrupted run resumes correctly
//!
//! ## Example
//!
//! ```ignore
//! use converge::{
//!     Action, ExecuteOptions, FileStateStore, NoProgress, Registry, StateStore, Step,
//!     execute, plan,
//! };
//! use std::sync::Arc;
//!
//! let registry = Registry::from_steps([
//!     Step::new("git", Action::Package { name: "git".into() }),
//!     Step::new("omz", Action::GitClone {
//!         url: "https://github.com/ohmyzsh/ohmyzsh".into(),
//!         dest: "~/.oh-my-zsh".into(),
//!         branch: None,
//!     })
//!     .after(["git"]),
//! ])?;
//!
//! let plan = plan(&registry)?;
//! let mut store = FileStateStore::new("/tmp/provision-state");
//! let prior = store.load()?;
//! let report = execute(
//!     &plan,
//!     Arc::new(MyBackend),
//!     &prior,
//!     &mut store,
//!     &ExecuteOptions::default(),
//!     &mut NoProgress,
//! )?;
//! ```
//!
//! ## Provider Traits
//!
//! - [`InstallerBackend`]: probes and performs steps on a concrete platform
//! - [`StateStore`]: persists results between runs
//! - [`ProgressCallback`]: receives progress updates
//!
//! The engine never touches the filesystem or a package manager itself;
//! all machine mutation goes through the bound backend.

pub mod backend;
pub mod context;
pub mod error;
pub mod executor;
pub mod lock;
pub mod planner;
pub mod registry;
pub mod retry;
pub mod state;
pub mod types;

// Re-export main types at crate root
pub use backend::{CallContext, InstallerBackend, deadline_after};
pub use context::{CancelToken, NoProgress, ProgressCallback};
pub use error::{
    BackendError, ErrorCategory, ExecuteError, LockError, PlanError, RegistryError,
    StateStoreError,
};
pub use executor::{ExecuteOptions, execute, new_run_id};
pub use lock::RunLock;
pub use planner::{Plan, plan, plan_for};
pub use registry::Registry;
pub use retry::{RetryCallback, RetryConfig, with_retry};
pub use state::{FileStateStore, HistoryEntry, MemoryStateStore, RunState, StateStore, StepRecord};
pub use types::{
    Action, Category, RunReport, RunSummary, Step, StepOutcome, StepReport, StepResult,
};
