//! Execution engine - runs a plan step by step against an installer backend
//!
//! Steps run strictly in plan order on the calling thread. Each backend
//! call is made on a watchdog thread so a hung installer cannot stall the
//! run past the step timeout. Every result is persisted before the next
//! step starts.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{CallContext, InstallerBackend, deadline_after};
use crate::context::{CancelToken, ProgressCallback};
use crate::error::{BackendError, ExecuteError};
use crate::planner::Plan;
use crate::retry::{RetryConfig, with_retry};
use crate::state::{RunState, StateStore, StepRecord};
use crate::types::{RunReport, Step, StepResult};

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Wall-clock budget for one step (probe, apply and retries)
    pub step_timeout: Duration,
    /// Retry policy for transient backend failures
    pub retry: RetryConfig,
    /// Skip probing steps recorded as succeeded under the same definition
    pub trust_state: bool,
    /// Checked between steps
    pub cancel: CancelToken,
    /// Run id; generated from the clock when absent
    pub run_id: Option<String>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(600),
            retry: RetryConfig::default(),
            trust_state: false,
            cancel: CancelToken::new(),
            run_id: None,
        }
    }
}

/// Generate a run id from the current time
pub fn new_run_id() -> String {
    Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

/// Execute a plan
///
/// A failed step never aborts the run: its dependents are marked Blocked
/// and independent steps still execute. The only error returned is a state
/// store failure, because the run could no longer be resumed correctly.
pub fn execute<B, S, P>(
    plan: &Plan,
    backend: Arc<B>,
    prior: &RunState,
    store: &mut S,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> Result<RunReport, ExecuteError>
where
    B: InstallerBackend + ?Sized + 'static,
    S: StateStore + ?Sized,
    P: ProgressCallback + ?Sized,
{
    let run_id = opts.run_id.clone().unwrap_or_else(new_run_id);
    let mut report = RunReport::new(&run_id);
    let mut succeeded: HashMap<&str, bool> = HashMap::with_capacity(plan.len());
    let total = plan.len();

    log::info!(
        "Run {}: {} steps via backend {}",
        run_id,
        total,
        backend.name()
    );
    progress.on_run_start(&run_id, total);

    for (index, step) in plan.steps().iter().enumerate() {
        if opts.cancel.is_cancelled() {
            log::warn!(
                "Run {} interrupted before step {} ({} of {} remaining)",
                run_id,
                step.id,
                total - index,
                total
            );
            report.interrupted = true;
            break;
        }

        progress.on_step_start(index + 1, total, step);
        let started = Instant::now();

        let blocked_by: Vec<String> = step
            .depends_on
            .iter()
            .filter(|dep| succeeded.get(dep.as_str()) == Some(&false))
            .cloned()
            .collect();

        let fingerprint = step.fingerprint();
        let result = if !blocked_by.is_empty() {
            log::info!("{}: blocked by {}", step.id, blocked_by.join(", "));
            StepResult::Blocked { by: blocked_by }
        } else if opts.trust_state && prior.succeeded_with(&step.id, &fingerprint) {
            log::debug!("{}: trusted from recorded state", step.id);
            StepResult::Skipped {
                reason: "recorded as satisfied".to_string(),
            }
        } else {
            run_step(step, &backend, prior, opts, progress)
        };

        let record = StepRecord::new(&run_id, &fingerprint, &result);
        store
            .record_step(&step.id, &record)
            .map_err(|source| ExecuteError::State {
                step: step.id.clone(),
                source,
            })?;

        succeeded.insert(step.id.as_str(), result.is_success());
        progress.on_step_complete(step, &result);
        report.push(&step.id, result, started.elapsed());
    }

    log::info!(
        "Run {} finished: {} applied, {} skipped, {} failed, {} blocked",
        run_id,
        report.summary.applied,
        report.summary.skipped,
        report.summary.failed,
        report.summary.blocked
    );

    Ok(report)
}

/// Probe, then apply if needed, sharing one deadline
fn run_step<B, P>(
    step: &Arc<Step>,
    backend: &Arc<B>,
    prior: &RunState,
    opts: &ExecuteOptions,
    progress: &mut P,
) -> StepResult
where
    B: InstallerBackend + ?Sized + 'static,
    P: ProgressCallback + ?Sized,
{
    let deadline = deadline_after(opts.step_timeout);
    let budget = opts.step_timeout;
    let mut on_retry = |attempt: u32, max: u32, error: &BackendError, delay: Duration| {
        progress.on_retry(step, attempt, max, error, delay);
    };

    let probed = with_retry(&opts.retry, deadline, budget, Some(&mut on_retry), || {
        invoke(backend, step, deadline, budget, Call::Probe)
    });

    match probed {
        Ok((true, _)) => {
            return StepResult::Skipped {
                reason: "already satisfied".to_string(),
            };
        }
        Ok((false, _)) => {
            if prior.get(&step.id).is_some_and(|r| r.outcome.is_success()) {
                log::warn!(
                    "{}: recorded as {} but no longer satisfied, re-applying",
                    step.id,
                    prior.get(&step.id).map(|r| r.outcome.as_str()).unwrap_or("")
                );
            }
        }
        Err((cause, attempts)) => {
            log::warn!("{}: probe failed: {}", step.id, cause);
            return StepResult::Failed { cause, attempts };
        }
    }

    let applied = with_retry(&opts.retry, deadline, budget, Some(&mut on_retry), || {
        invoke(backend, step, deadline, budget, Call::Apply).map(|_| true)
    });

    match applied {
        Ok((_, attempts)) => StepResult::Applied { attempts },
        Err((cause, attempts)) => {
            log::warn!("{}: apply failed after {} attempt(s): {}", step.id, attempts, cause);
            StepResult::Failed { cause, attempts }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Call {
    Probe,
    Apply,
}

/// Make one backend call on a watchdog thread
///
/// If the deadline passes first, the call's abort flag is raised and the
/// step is reported as timed out. The worker thread is left to wind down on
/// its own.
fn invoke<B>(
    backend: &Arc<B>,
    step: &Arc<Step>,
    deadline: Instant,
    budget: Duration,
    call: Call,
) -> Result<bool, BackendError>
where
    B: InstallerBackend + ?Sized + 'static,
{
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(BackendError::Timeout(budget));
    }

    let ctx = CallContext::new(deadline);
    let (tx, rx) = mpsc::channel();

    let worker_backend = Arc::clone(backend);
    let worker_step = Arc::clone(step);
    let worker_ctx = ctx.clone();
    let spawned = thread::Builder::new()
        .name(format!("step-{}", step.id))
        .spawn(move || {
            let result = match call {
                Call::Probe => worker_backend.probe(&worker_step, &worker_ctx),
                Call::Apply => worker_backend
                    .apply(&worker_step, &worker_ctx)
                    .map(|()| true),
            };
            // Receiver may be gone after a timeout
            let _ = tx.send(result);
        });

    if let Err(e) = spawned {
        return Err(BackendError::permanent(format!(
            "failed to spawn worker thread: {e}"
        )));
    }

    match rx.recv_timeout(remaining) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            ctx.abort();
            log::warn!("{}: {:?} exceeded {:?}", step.id, call, budget);
            Err(BackendError::Timeout(budget))
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(BackendError::permanent(
            "backend panicked".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoProgress;
    use crate::planner;
    use crate::registry::Registry;
    use crate::state::MemoryStateStore;
    use crate::types::{Action, StepOutcome};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// How the scripted backend answers `apply` for one step
    #[derive(Clone)]
    enum Script {
        Succeed,
        FailPermanent,
        FailTransient(u32),
        Hang(Duration),
        Panic,
    }

    /// Backend that remembers what it installed
    #[derive(Default)]
    struct ScriptedBackend {
        scripts: HashMap<String, Script>,
        installed: Mutex<HashSet<String>>,
        probes: Mutex<Vec<String>>,
        applies: Mutex<Vec<String>>,
        transient_seen: Mutex<HashMap<String, u32>>,
    }

    impl ScriptedBackend {
        fn with(mut self, id: &str, script: Script) -> Self {
            self.scripts.insert(id.to_string(), script);
            self
        }

        fn preinstalled(self, id: &str) -> Self {
            self.installed.lock().unwrap().insert(id.to_string());
            self
        }

        fn applies(&self) -> Vec<String> {
            self.applies.lock().unwrap().clone()
        }

        fn probes(&self) -> Vec<String> {
            self.probes.lock().unwrap().clone()
        }
    }

    impl InstallerBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn probe(&self, step: &Step, _ctx: &CallContext) -> Result<bool, BackendError> {
            self.probes.lock().unwrap().push(step.id.clone());
            Ok(self.installed.lock().unwrap().contains(&step.id))
        }

        fn apply(&self, step: &Step, ctx: &CallContext) -> Result<(), BackendError> {
            self.applies.lock().unwrap().push(step.id.clone());
            match self.scripts.get(&step.id).cloned().unwrap_or(Script::Succeed) {
                Script::Succeed => {}
                Script::FailPermanent => {
                    return Err(BackendError::permanent(format!("{} is broken", step.id)));
                }
                Script::FailTransient(times) => {
                    let mut seen = self.transient_seen.lock().unwrap();
                    let count = seen.entry(step.id.clone()).or_default();
                    if *count < times {
                        *count += 1;
                        return Err(BackendError::transient("connection reset"));
                    }
                }
                Script::Hang(duration) => {
                    let until = Instant::now() + duration;
                    while Instant::now() < until && !ctx.is_aborted() {
                        thread::sleep(Duration::from_millis(5));
                    }
                    return Err(BackendError::permanent("hung"));
                }
                Script::Panic => panic!("backend bug"),
            }
            self.installed.lock().unwrap().insert(step.id.clone());
            Ok(())
        }
    }

    fn step(id: &str, deps: &[&str]) -> Step {
        Step::new(id, Action::Package { name: id.into() }).after(deps.iter().copied())
    }

    fn plan_of(steps: Vec<Step>) -> Plan {
        planner::plan(&Registry::from_steps(steps).unwrap()).unwrap()
    }

    fn fast_opts() -> ExecuteOptions {
        ExecuteOptions {
            step_timeout: Duration::from_secs(5),
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                backoff_factor: 2.0,
                max_delay: Duration::from_millis(5),
            },
            run_id: Some("run-1".into()),
            ..Default::default()
        }
    }

    fn run(
        plan: &Plan,
        backend: &Arc<ScriptedBackend>,
        store: &mut MemoryStateStore,
        opts: &ExecuteOptions,
    ) -> RunReport {
        let prior = store.load().unwrap();
        execute(plan, Arc::clone(backend), &prior, store, opts, &mut NoProgress).unwrap()
    }

    #[test]
    fn test_empty_plan() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut store = MemoryStateStore::new();
        let report = run(&Plan::default(), &backend, &mut store, &fast_opts());

        assert!(report.entries.is_empty());
        assert!(report.is_success());
        assert!(!report.interrupted);
    }

    #[test]
    fn test_huge_step_timeout_does_not_overflow() {
        let plan = plan_of(vec![step("A", &[]), step("B", &["A"])]);
        let backend = Arc::new(ScriptedBackend::default());
        let mut store = MemoryStateStore::new();
        let opts = ExecuteOptions {
            step_timeout: Duration::from_secs(u64::MAX),
            ..fast_opts()
        };

        let report = run(&plan, &backend, &mut store, &opts);

        assert_eq!(report.summary.applied, 2);
        assert!(report.is_success());
    }

    #[test]
    fn test_failure_blocks_dependents_only() {
        let plan = plan_of(vec![step("A", &[]), step("B", &["A"]), step("C", &[])]);
        let backend = Arc::new(ScriptedBackend::default().with("A", Script::FailPermanent));
        let mut store = MemoryStateStore::new();

        let report = run(&plan, &backend, &mut store, &fast_opts());

        assert!(matches!(
            report.result_of("A"),
            Some(StepResult::Failed { attempts: 1, .. })
        ));
        assert_eq!(
            report.result_of("B"),
            Some(&StepResult::Blocked {
                by: vec!["A".into()]
            })
        );
        assert_eq!(
            report.result_of("C"),
            Some(&StepResult::Applied { attempts: 1 })
        );
        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.blocked, 1);
        assert!(!report.is_success());

        // B never reached the backend
        assert!(!backend.probes().contains(&"B".to_string()));
        assert!(!backend.applies().contains(&"B".to_string()));
    }

    #[test]
    fn test_blocked_propagates_transitively() {
        let plan = plan_of(vec![
            step("A", &[]),
            step("B", &["A"]),
            step("C", &["B"]),
        ]);
        let backend = Arc::new(ScriptedBackend::default().with("A", Script::FailPermanent));
        let mut store = MemoryStateStore::new();

        let report = run(&plan, &backend, &mut store, &fast_opts());

        assert_eq!(
            report.result_of("C"),
            Some(&StepResult::Blocked {
                by: vec!["B".into()]
            })
        );
    }

    #[test]
    fn test_second_run_is_all_skipped() {
        let plan = plan_of(vec![step("zsh", &[]), step("omz", &["zsh"]), step("git", &[])]);
        let backend = Arc::new(ScriptedBackend::default().preinstalled("git"));
        let mut store = MemoryStateStore::new();

        let first = run(&plan, &backend, &mut store, &fast_opts());
        assert_eq!(first.summary.applied, 2);
        assert_eq!(first.summary.skipped, 1);

        let second = run(&plan, &backend, &mut store, &fast_opts());
        assert_eq!(second.summary.skipped, 3);
        assert_eq!(second.summary.applied, 0);
        assert_eq!(backend.applies(), vec!["zsh", "omz"]);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let plan = plan_of(vec![step("node", &[])]);
        let backend = Arc::new(ScriptedBackend::default().with("node", Script::FailTransient(2)));
        let mut store = MemoryStateStore::new();

        let report = run(&plan, &backend, &mut store, &fast_opts());

        assert_eq!(
            report.result_of("node"),
            Some(&StepResult::Applied { attempts: 3 })
        );
        assert_eq!(backend.applies().len(), 3);
    }

    #[test]
    fn test_transient_failures_exhaust_attempts() {
        let plan = plan_of(vec![step("node", &[])]);
        let backend = Arc::new(ScriptedBackend::default().with("node", Script::FailTransient(10)));
        let mut store = MemoryStateStore::new();

        let report = run(&plan, &backend, &mut store, &fast_opts());

        let Some(StepResult::Failed { cause, attempts }) = report.result_of("node") else {
            panic!("expected failure");
        };
        assert!(cause.is_retryable());
        assert_eq!(*attempts, 3);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let plan = plan_of(vec![step("node", &[])]);
        let backend = Arc::new(ScriptedBackend::default().with("node", Script::FailPermanent));
        let mut store = MemoryStateStore::new();

        run(&plan, &backend, &mut store, &fast_opts());
        assert_eq!(backend.applies().len(), 1);
    }

    #[test]
    fn test_hung_apply_times_out_and_blocks_dependents() {
        let plan = plan_of(vec![
            step("slow", &[]),
            step("after", &["slow"]),
            step("other", &[]),
        ]);
        let backend = Arc::new(
            ScriptedBackend::default().with("slow", Script::Hang(Duration::from_secs(30))),
        );
        let mut store = MemoryStateStore::new();
        let opts = ExecuteOptions {
            step_timeout: Duration::from_millis(100),
            ..fast_opts()
        };

        let started = Instant::now();
        let report = run(&plan, &backend, &mut store, &opts);

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            report.result_of("slow"),
            Some(&StepResult::Failed {
                cause: BackendError::Timeout(Duration::from_millis(100)),
                attempts: 1
            })
        );
        assert!(matches!(
            report.result_of("after"),
            Some(StepResult::Blocked { .. })
        ));
        assert_eq!(
            report.result_of("other"),
            Some(&StepResult::Applied { attempts: 1 })
        );
    }

    #[test]
    fn test_backend_panic_is_a_failure() {
        let plan = plan_of(vec![step("bad", &[]), step("good", &[])]);
        let backend = Arc::new(ScriptedBackend::default().with("bad", Script::Panic));
        let mut store = MemoryStateStore::new();

        let report = run(&plan, &backend, &mut store, &fast_opts());

        assert_eq!(report.summary.failed, 1);
        assert_eq!(report.summary.applied, 1);
    }

    #[test]
    fn test_results_are_persisted_per_step() {
        let plan = plan_of(vec![step("A", &[]), step("B", &["A"]), step("C", &[])]);
        let backend = Arc::new(ScriptedBackend::default().with("A", Script::FailPermanent));
        let mut store = MemoryStateStore::new();

        run(&plan, &backend, &mut store, &fast_opts());

        let state = store.load().unwrap();
        assert_eq!(state.get("A").unwrap().outcome, StepOutcome::Failed);
        assert_eq!(state.get("B").unwrap().outcome, StepOutcome::Blocked);
        assert_eq!(state.get("C").unwrap().outcome, StepOutcome::Applied);
        assert_eq!(state.last_run.as_deref(), Some("run-1"));

        let order: Vec<&str> = store.history().iter().map(|h| h.step.as_str()).collect();
        assert_eq!(order, plan.ids());
    }

    /// Cancels the run once a given number of steps have completed
    struct CancelAfter {
        remaining: usize,
        token: CancelToken,
    }

    impl ProgressCallback for CancelAfter {
        fn on_step_start(&mut self, _index: usize, _total: usize, _step: &Step) {}

        fn on_step_complete(&mut self, _step: &Step, _result: &StepResult) {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.token.cancel();
            }
        }
    }

    #[test]
    fn test_interrupted_run_resumes() {
        let plan = plan_of(vec![
            step("s1", &[]),
            step("s2", &["s1"]),
            step("s3", &["s2"]),
            step("s4", &[]),
        ]);
        let backend = Arc::new(ScriptedBackend::default());
        let mut store = MemoryStateStore::new();
        let token = CancelToken::new();
        let opts = ExecuteOptions {
            cancel: token.clone(),
            ..fast_opts()
        };

        let prior = store.load().unwrap();
        let mut progress = CancelAfter {
            remaining: 2,
            token,
        };
        let first = execute(&plan, Arc::clone(&backend), &prior, &mut store, &opts, &mut progress)
            .unwrap();

        assert!(first.interrupted);
        assert_eq!(first.entries.len(), 2);
        let state = store.load().unwrap();
        assert_eq!(state.steps.len(), 2);
        assert!(state.get("s3").is_none());

        // New run: completed steps probe as satisfied, only the rest are applied
        let opts = ExecuteOptions {
            run_id: Some("run-2".into()),
            ..fast_opts()
        };
        let second = run(&plan, &backend, &mut store, &opts);

        assert!(!second.interrupted);
        assert_eq!(second.result_of("s1").map(StepResult::outcome), Some(StepOutcome::Skipped));
        assert_eq!(second.result_of("s2").map(StepResult::outcome), Some(StepOutcome::Skipped));
        assert_eq!(second.result_of("s3").map(StepResult::outcome), Some(StepOutcome::Applied));
        assert_eq!(second.result_of("s4").map(StepResult::outcome), Some(StepOutcome::Applied));
        assert_eq!(backend.applies(), vec!["s1", "s2", "s3", "s4"]);
    }

    #[test]
    fn test_trust_state_skips_probe() {
        let plan = plan_of(vec![step("zsh", &[])]);
        let backend = Arc::new(ScriptedBackend::default());
        let mut store = MemoryStateStore::new();
        run(&plan, &backend, &mut store, &fast_opts());
        assert_eq!(backend.probes().len(), 1);

        let opts = ExecuteOptions {
            trust_state: true,
            ..fast_opts()
        };
        let report = run(&plan, &backend, &mut store, &opts);

        assert_eq!(report.summary.skipped, 1);
        assert_eq!(backend.probes().len(), 1);
    }

    #[test]
    fn test_trust_state_ignores_changed_definition() {
        let backend = Arc::new(ScriptedBackend::default());
        let mut store = MemoryStateStore::new();
        run(&plan_of(vec![step("zsh", &[])]), &backend, &mut store, &fast_opts());

        let changed = plan_of(vec![step("zsh", &[]).with_description("zsh, but newer")]);
        let opts = ExecuteOptions {
            trust_state: true,
            ..fast_opts()
        };
        run(&changed, &backend, &mut store, &opts);

        assert_eq!(backend.probes().len(), 2);
    }

    #[test]
    fn test_state_store_failure_aborts_run() {
        struct BrokenStore;

        impl StateStore for BrokenStore {
            fn load(&self) -> Result<RunState, crate::error::StateStoreError> {
                Ok(RunState::default())
            }

            fn record_step(
                &mut self,
                _step_id: &str,
                _record: &StepRecord,
            ) -> Result<(), crate::error::StateStoreError> {
                Err(crate::error::StateStoreError::Encode("disk full".into()))
            }

            fn reset(&mut self) -> Result<(), crate::error::StateStoreError> {
                Ok(())
            }
        }

        let plan = plan_of(vec![step("A", &[]), step("B", &[])]);
        let backend = Arc::new(ScriptedBackend::default());
        let err = execute(
            &plan,
            Arc::clone(&backend),
            &RunState::default(),
            &mut BrokenStore,
            &fast_opts(),
            &mut NoProgress,
        )
        .unwrap_err();

        assert!(matches!(err, ExecuteError::State { ref step, .. } if step == "A"));
        assert_eq!(backend.applies(), vec!["A"]);
    }
}
