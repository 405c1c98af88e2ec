//! The default command: plan and converge the machine

use anyhow::{Context as _, Result};
use colored::Colorize;
use converge::{
    CancelToken, FileStateStore, Plan, RunLock, RunReport, RunState, StateStore, StepResult,
    execute, plan, plan_for,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::RunOutcome;
use crate::Context;
use crate::backend::SystemBackend;
use crate::cli::Cli;
use crate::config::ProvisionConfig;
use crate::paths;
use crate::progress::TerminalProgress;
use crate::signal;
use crate::ui;

pub fn run(ctx: &Context, cli: &Cli) -> Result<RunOutcome> {
    let config_path = super::config_path(cli.config.as_ref())?;
    let state_dir = paths::state_dir()?;

    let cancel = CancelToken::new();
    if !cli.plan_only {
        signal::install(&cancel)?;
    }

    run_in(ctx, cli, &config_path, &state_dir, cancel)
}

/// Run against explicit config and state locations
pub fn run_in(
    ctx: &Context,
    cli: &Cli,
    config_path: &Path,
    state_dir: &Path,
    cancel: CancelToken,
) -> Result<RunOutcome> {
    let config = ProvisionConfig::load(config_path)?;
    let registry = config.registry()?;
    let plan = if cli.steps.is_empty() {
        plan(&registry)?
    } else {
        plan_for(&registry, &cli.steps)?
    };
    log::info!(
        "Planned {} of {} step(s) from {}",
        plan.len(),
        registry.len(),
        config_path.display()
    );

    let mut store = FileStateStore::new(state_dir);

    if cli.plan_only {
        if cli.reset {
            let _lock = RunLock::acquire(state_dir.join(paths::LOCK_FILE))?;
            store.reset()?;
            if !ctx.quiet {
                ui::success("Recorded state cleared");
            }
        }
        let prior = store.load()?;
        print_plan(&plan, &prior);
        return Ok(RunOutcome::Success);
    }

    let _lock = RunLock::acquire(state_dir.join(paths::LOCK_FILE))?;

    if cli.reset {
        store.reset()?;
        log::info!("Recorded state cleared");
    }
    let prior = store.load()?;

    let mut opts = config.execute_options();
    opts.cancel = cancel;
    if cli.trust_state {
        opts.trust_state = true;
    }
    if let Some(secs) = cli.step_timeout {
        opts.step_timeout = Duration::from_secs(secs);
    }

    let backend = Arc::new(SystemBackend::new(config.backend_settings()?));
    let mut progress = TerminalProgress::new(ctx.quiet);

    let report = execute(&plan, backend, &prior, &mut store, &opts, &mut progress)
        .context("Run aborted")?;

    print_report(ctx, &report);

    Ok(outcome_of(&report))
}

fn outcome_of(report: &RunReport) -> RunOutcome {
    if !report.is_success() {
        RunOutcome::StepsFailed
    } else if report.interrupted {
        RunOutcome::Interrupted
    } else {
        RunOutcome::Success
    }
}

fn print_plan(plan: &Plan, prior: &RunState) {
    ui::header("Execution plan");

    if plan.is_empty() {
        ui::dim("Nothing to do");
        return;
    }

    let width = plan.len().to_string().len();
    for (i, step) in plan.steps().iter().enumerate() {
        let recorded = prior.get(&step.id).map_or_else(
            || "never run".dimmed().to_string(),
            |r| format!("{} {}", ui::outcome_symbol(r.outcome), r.outcome.as_str().dimmed()),
        );
        println!(
            "  {} {} {} [{}]",
            format!("{:>width$}.", i + 1).blue(),
            step.id.bold(),
            step.describe().dimmed(),
            recorded
        );
        if !step.depends_on.is_empty() {
            ui::dim(&format!("     after {}", step.depends_on.join(", ")));
        }
    }
}

fn print_report(ctx: &Context, report: &RunReport) {
    let summary = &report.summary;

    if !ctx.quiet {
        ui::header("Summary");
        for entry in &report.entries {
            let outcome = entry.result.outcome();
            let extra = match &entry.result {
                StepResult::Applied { attempts } if *attempts > 1 => {
                    format!(" after {attempts} attempts")
                }
                _ => String::new(),
            };
            println!(
                "  {} {:<24} {}{} {}",
                ui::outcome_symbol(outcome),
                entry.id,
                ui::outcome_label(outcome),
                extra,
                ui::format_duration(entry.duration).dimmed()
            );
        }
        println!();
        println!(
            "  {} applied, {} skipped, {} failed, {} blocked",
            summary.applied.to_string().green(),
            summary.skipped.to_string().dimmed(),
            summary.failed.to_string().red(),
            summary.blocked.to_string().yellow()
        );
    }

    if report.interrupted {
        ui::warn("Interrupted; completed steps are recorded and the next run resumes from there");
    }

    if !report.is_success() {
        for entry in &report.entries {
            if let StepResult::Failed { cause, .. } = &entry.result {
                ui::error(&format!("{}: {}", entry.id, cause));
            }
        }
    } else if !ctx.quiet && !report.interrupted {
        ui::success("Machine is up to date");
    }
}
