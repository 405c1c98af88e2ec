//! Core types for provisioning steps and their outcomes

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::BackendError;

/// Classification tag for a step
///
/// Informational only: the engine never branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Package,
    Service,
    File,
    ShellPlugin,
    #[default]
    #[serde(other)]
    Other,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Package => "package",
            Self::Service => "service",
            Self::File => "file",
            Self::ShellPlugin => "shell-plugin",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability reference handed to the installer backend
///
/// The engine treats actions as opaque data; only the bound backend
/// knows how to probe or perform them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    /// Shell snippet; exit status 0 means satisfied / applied
    Command { run: String },
    /// Package installed through the platform package manager
    Package { name: String },
    /// Git repository cloned at a destination
    GitClone {
        url: String,
        dest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        branch: Option<String>,
    },
    /// Symbolic link at `target` pointing to `source`
    Symlink { source: String, target: String },
    /// File with fixed contents
    File { path: String, contents: String },
}

impl Action {
    /// Short human-readable summary used in plans and reports
    pub fn summary(&self) -> String {
        match self {
            Self::Command { run } => format!("run `{}`", first_line(run)),
            Self::Package { name } => format!("install package {name}"),
            Self::GitClone { url, dest, .. } => format!("clone {url} into {dest}"),
            Self::Symlink { source, target } => format!("link {target} -> {source}"),
            Self::File { path, .. } => format!("write {path}"),
        }
    }
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("").trim()
}

/// A unit of provisioning work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// Unique identifier within a registry
    pub id: String,

    /// Steps that must succeed before this one runs
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub category: Category,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Idempotency probe. When absent the backend derives one from `apply`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<Action>,

    pub apply: Action,
}

impl Step {
    pub fn new(id: impl Into<String>, apply: Action) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            category: Category::Other,
            description: None,
            check: None,
            apply,
        }
    }

    /// Add dependencies (duplicates are ignored)
    pub fn after<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }

    pub fn with_check(mut self, check: Action) -> Self {
        self.check = Some(check);
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Human-readable description, falling back to the apply action
    pub fn describe(&self) -> String {
        self.description
            .clone()
            .unwrap_or_else(|| self.apply.summary())
    }

    /// Remove duplicate dependency entries, keeping first-seen order
    pub(crate) fn dedup_dependencies(&mut self) {
        let mut seen = Vec::with_capacity(self.depends_on.len());
        self.depends_on.retain(|dep| {
            if seen.contains(dep) {
                false
            } else {
                seen.push(dep.clone());
                true
            }
        });
    }

    /// Stable hash of the step definition
    ///
    /// Persisted alongside each record so a definition that changed
    /// between runs is never trusted from old state.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        // Serializing a plain data struct to JSON cannot fail
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hasher.update(&encoded);
        hasher.finalize().to_hex()[..16].to_string()
    }
}

/// Persisted outcome tag of a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepOutcome {
    Skipped,
    Applied,
    Failed,
    Blocked,
    /// Written by a newer version of the tool
    #[serde(other)]
    Unknown,
}

impl StepOutcome {
    /// Whether dependents may run after this outcome
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Skipped | Self::Applied)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Applied => "applied",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of executing one step during a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Already satisfied; the backend apply was not invoked
    Skipped { reason: String },
    /// Apply ran and succeeded
    Applied { attempts: u32 },
    /// Apply (or its probe) failed
    Failed { cause: BackendError, attempts: u32 },
    /// A dependency failed or was blocked this run
    Blocked { by: Vec<String> },
}

impl StepResult {
    pub fn outcome(&self) -> StepOutcome {
        match self {
            Self::Skipped { .. } => StepOutcome::Skipped,
            Self::Applied { .. } => StepOutcome::Applied,
            Self::Failed { .. } => StepOutcome::Failed,
            Self::Blocked { .. } => StepOutcome::Blocked,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome().is_success()
    }

    pub fn attempts(&self) -> u32 {
        match self {
            Self::Applied { attempts } | Self::Failed { attempts, .. } => *attempts,
            Self::Skipped { .. } | Self::Blocked { .. } => 0,
        }
    }

    /// Extra detail worth persisting or displaying
    pub fn detail(&self) -> Option<String> {
        match self {
            Self::Skipped { reason } => Some(reason.clone()),
            Self::Applied { .. } => None,
            Self::Failed { cause, .. } => Some(cause.to_string()),
            Self::Blocked { by } => Some(format!("blocked by {}", by.join(", "))),
        }
    }
}

/// One line of a run report
#[derive(Debug, Clone)]
pub struct StepReport {
    pub id: String,
    pub result: StepResult,
    pub duration: Duration,
}

/// Aggregate counts for a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub skipped: usize,
    pub applied: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl RunSummary {
    pub fn add_result(&mut self, result: &StepResult) {
        match result {
            StepResult::Skipped { .. } => self.skipped += 1,
            StepResult::Applied { .. } => self.applied += 1,
            StepResult::Failed { .. } => self.failed += 1,
            StepResult::Blocked { .. } => self.blocked += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.skipped + self.applied + self.failed + self.blocked
    }

    /// No step failed or was blocked
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.blocked == 0
    }
}

/// Result of executing a plan
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub run_id: String,
    /// Attempted steps in plan order
    pub entries: Vec<StepReport>,
    pub summary: RunSummary,
    /// Cancellation stopped the run before the plan was exhausted
    pub interrupted: bool,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub(crate) fn push(&mut self, id: &str, result: StepResult, duration: Duration) {
        self.summary.add_result(&result);
        self.entries.push(StepReport {
            id: id.to_string(),
            result,
            duration,
        });
    }

    pub fn result_of(&self, id: &str) -> Option<&StepResult> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.result)
    }

    pub fn is_success(&self) -> bool {
        self.summary.is_success()
    }
}
