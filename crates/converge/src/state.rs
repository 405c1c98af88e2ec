//! State store - durable per-step results that make runs resumable
//!
//! The file store keeps two files in its directory:
//! - `state.toml`: latest record per step id, rewritten atomically
//! - `history.jsonl`: append-only log of every recorded result, keyed by run id
//!
//! Both are fsynced before `record_step` returns.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::StateStoreError;
use crate::types::{StepOutcome, StepResult};

const STATE_FILE: &str = "state.toml";
const HISTORY_FILE: &str = "history.jsonl";
const STATE_VERSION: u32 = 1;

/// Last known result of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub outcome: StepOutcome,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub run_id: String,

    /// Fingerprint of the step definition that produced this record
    #[serde(default)]
    pub fingerprint: String,

    pub recorded_at: DateTime<Utc>,
}

impl StepRecord {
    pub fn new(run_id: &str, fingerprint: &str, result: &StepResult) -> Self {
        Self {
            outcome: result.outcome(),
            detail: result.detail(),
            attempts: result.attempts(),
            run_id: run_id.to_string(),
            fingerprint: fingerprint.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Durable mapping of step id to last result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    #[serde(default = "default_version")]
    pub version: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<String>,

    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
}

fn default_version() -> u32 {
    STATE_VERSION
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            last_run: None,
            steps: BTreeMap::new(),
        }
    }
}

impl RunState {
    pub fn get(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether the step last succeeded under the same definition
    pub fn succeeded_with(&self, id: &str, fingerprint: &str) -> bool {
        self.get(id)
            .is_some_and(|r| r.outcome.is_success() && r.fingerprint == fingerprint)
    }

    fn apply(&mut self, step_id: &str, record: StepRecord) {
        self.last_run = Some(record.run_id.clone());
        self.steps.insert(step_id.to_string(), record);
    }
}

/// One line of the append-only history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: String,
    #[serde(flatten)]
    pub record: StepRecord,
}

impl HistoryEntry {
    pub fn run_id(&self) -> &str {
        &self.record.run_id
    }
}

/// Persistence for run state
pub trait StateStore {
    /// Load the recorded state (empty if there was no prior run)
    fn load(&self) -> Result<RunState, StateStoreError>;

    /// Record the result of one step, durably, before returning
    fn record_step(
        &mut self,
        step_id: &str,
        record: &StepRecord,
    ) -> Result<(), StateStoreError>;

    /// Clear all recorded state
    fn reset(&mut self) -> Result<(), StateStoreError>;
}

/// State store backed by files in a directory
#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
    state: Option<RunState>,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_file(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn history_file(&self) -> PathBuf {
        self.dir.join(HISTORY_FILE)
    }

    /// Read history entries, optionally only those of one run
    ///
    /// Lines that fail to parse (e.g. a torn final write) are skipped.
    pub fn history(&self, run_id: Option<&str>) -> Result<Vec<HistoryEntry>, StateStoreError> {
        let path = self.history_file();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StateStoreError::io(&path, e)),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StateStoreError::io(&path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(&line) {
                Ok(entry) if run_id.is_none_or(|id| entry.run_id() == id) => entries.push(entry),
                Ok(_) => {}
                Err(e) => log::warn!("Skipping unreadable history line: {}", e),
            }
        }
        Ok(entries)
    }

    fn ensure_dir(&self) -> Result<(), StateStoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| StateStoreError::io(&self.dir, e))
    }

    fn append_history(&self, entry: &HistoryEntry) -> Result<(), StateStoreError> {
        let path = self.history_file();
        let mut line =
            serde_json::to_string(entry).map_err(|e| StateStoreError::Encode(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StateStoreError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| StateStoreError::io(&path, e))
    }

    fn write_state(&self, state: &RunState) -> Result<(), StateStoreError> {
        let path = self.state_file();
        let content =
            toml::to_string_pretty(state).map_err(|e| StateStoreError::Encode(e.to_string()))?;
        write_atomic(&path, content.as_bytes())
    }
}

impl StateStore for FileStateStore {
    fn load(&self) -> Result<RunState, StateStoreError> {
        let path = self.state_file();

        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("State file does not exist, using empty state");
                return Ok(RunState::default());
            }
            Err(e) => return Err(StateStoreError::io(&path, e)),
        };

        let state: RunState = toml::from_str(&content).map_err(|e| StateStoreError::Decode {
            path: path.clone(),
            message: e.to_string(),
        })?;

        log::debug!(
            "Loaded state for {} steps from {}",
            state.steps.len(),
            path.display()
        );
        Ok(state)
    }

    fn record_step(
        &mut self,
        step_id: &str,
        record: &StepRecord,
    ) -> Result<(), StateStoreError> {
        self.ensure_dir()?;

        let mut state = match self.state.take() {
            Some(s) => s,
            None => self.load()?,
        };

        self.append_history(&HistoryEntry {
            step: step_id.to_string(),
            record: record.clone(),
        })?;

        state.apply(step_id, record.clone());
        self.write_state(&state)?;
        self.state = Some(state);

        log::trace!("Recorded {} = {}", step_id, record.outcome);
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StateStoreError> {
        self.state = None;
        for path in [self.state_file(), self.history_file()] {
            match fs::remove_file(&path) {
                Ok(()) => log::debug!("Removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StateStoreError::io(&path, e)),
            }
        }
        Ok(())
    }
}

/// Write a file so readers see either the old or the new contents
///
/// Temp file in the same directory, fsync, rename, then fsync the directory
/// so the rename itself survives a crash.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), StateStoreError> {
    let tmp = path.with_extension("tmp");

    let mut file = File::create(&tmp).map_err(|e| StateStoreError::io(&tmp, e))?;
    file.write_all(contents)
        .and_then(|()| file.sync_all())
        .map_err(|e| StateStoreError::io(&tmp, e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| StateStoreError::io(path, e))?;

    #[cfg(unix)]
    if let Some(parent) = path.parent() {
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| StateStoreError::io(parent, e))?;
    }

    Ok(())
}

/// In-memory state store for tests and embedding
#[derive(Debug, Default, Clone)]
pub struct MemoryStateStore {
    state: RunState,
    history: Vec<HistoryEntry>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RunState) -> Self {
        Self {
            state,
            history: Vec::new(),
        }
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Result<RunState, StateStoreError> {
        Ok(self.state.clone())
    }

    fn record_step(
        &mut self,
        step_id: &str,
        record: &StepRecord,
    ) -> Result<(), StateStoreError> {
        self.history.push(HistoryEntry {
            step: step_id.to_string(),
            record: record.clone(),
        });
        self.state.apply(step_id, record.clone());
        Ok(())
    }

    fn reset(&mut self) -> Result<(), StateStoreError> {
        self.state = RunState::default();
        self.history.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use tempfile::TempDir;

    fn applied(run: &str) -> StepRecord {
        StepRecord::new(run, "abc", &StepResult::Applied { attempts: 1 })
    }

    #[test]
    fn test_load_missing_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = FileStateStore::new(tmp.path().join("state"));
        let state = store.load().unwrap();
        assert!(state.is_empty());
        assert!(state.last_run.is_none());
    }

    #[test]
    fn test_record_survives_reload() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("state");

        let mut store = FileStateStore::new(&dir);
        store.record_step("zsh", &applied("run-1")).unwrap();
        store
            .record_step(
                "omz",
                &StepRecord::new(
                    "run-1",
                    "def",
                    &StepResult::Failed {
                        cause: BackendError::permanent("clone failed"),
                        attempts: 1,
                    },
                ),
            )
            .unwrap();

        // A fresh store sees exactly what was recorded
        let state = FileStateStore::new(&dir).load().unwrap();
        assert_eq!(state.last_run.as_deref(), Some("run-1"));
        assert_eq!(state.get("zsh").unwrap().outcome, StepOutcome::Applied);
        assert_eq!(state.get("omz").unwrap().outcome, StepOutcome::Failed);
        assert_eq!(
            state.get("omz").unwrap().detail.as_deref(),
            Some("clone failed")
        );
        assert!(!dir.join("state.tmp").exists());
    }

    #[test]
    fn test_record_overwrites_previous_entry() {
        let tmp = TempDir::new().unwrap();
        let mut store = FileStateStore::new(tmp.path());

        store.record_step("zsh", &applied("run-1")).unwrap();
        store
            .record_step(
                "zsh",
                &StepRecord::new(
                    "run-2",
                    "abc",
                    &StepResult::Skipped {
                        reason: "already satisfied".into(),
                    },
                ),
            )
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.get("zsh").unwrap().run_id, "run-2");
        assert_eq!(state.get("zsh").unwrap().outcome, StepOutcome::Skipped);
    }

    #[test]
    fn test_history_is_append_only_and_keyed_by_run() {
        let tmp = TempDir::new().unwrap();
        let mut store = FileStateStore::new(tmp.path());

        store.record_step("zsh", &applied("run-1")).unwrap();
        store.record_step("git", &applied("run-1")).unwrap();
        store.record_step("zsh", &applied("run-2")).unwrap();

        assert_eq!(store.history(None).unwrap().len(), 3);
        let first = store.history(Some("run-1")).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].step, "zsh");
        assert_eq!(first[1].step, "git");
    }

    #[test]
    fn test_reset_clears_everything() {
        let tmp = TempDir::new().unwrap();
        let mut store = FileStateStore::new(tmp.path());
        store.record_step("zsh", &applied("run-1")).unwrap();

        store.reset().unwrap();

        assert!(store.load().unwrap().is_empty());
        assert!(store.history(None).unwrap().is_empty());
        // Reset on an empty store is fine
        store.reset().unwrap();
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let tmp = TempDir::new().unwrap();
        fs::write(
            tmp.path().join("state.toml"),
            r#"
version = 7
last_run = "run-9"
future_setting = true

[steps.zsh]
outcome = "applied"
run_id = "run-9"
recorded_at = "2026-01-01T00:00:00Z"
checksum = "deadbeef"

[steps.docker]
outcome = "quarantined"
recorded_at = "2026-01-01T00:00:00Z"
"#,
        )
        .unwrap();

        let state = FileStateStore::new(tmp.path()).load().unwrap();
        assert_eq!(state.version, 7);
        assert_eq!(state.get("zsh").unwrap().outcome, StepOutcome::Applied);
        assert_eq!(state.get("zsh").unwrap().attempts, 0);
        assert_eq!(state.get("docker").unwrap().outcome, StepOutcome::Unknown);
    }

    #[test]
    fn test_corrupt_state_is_an_error() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("state.toml"), "steps = [").unwrap();
        let err = FileStateStore::new(tmp.path()).load().unwrap_err();
        assert!(matches!(err, StateStoreError::Decode { .. }));
    }

    #[test]
    fn test_succeeded_with_checks_fingerprint() {
        let mut store = MemoryStateStore::new();
        store.record_step("zsh", &applied("run-1")).unwrap();
        let state = store.load().unwrap();

        assert!(state.succeeded_with("zsh", "abc"));
        assert!(!state.succeeded_with("zsh", "changed"));
        assert!(!state.succeeded_with("git", "abc"));
    }
}
