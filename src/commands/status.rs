//! `--status`: show recorded state without executing anything

use anyhow::Result;
use colored::Colorize;
use converge::{FileStateStore, RunState, StateStore, StepOutcome};
use std::collections::BTreeSet;
use std::path::Path;

use crate::Context;
use crate::cli::Cli;
use crate::config::ProvisionConfig;
use crate::paths;
use crate::ui;

pub fn run(ctx: &Context, cli: &Cli) -> Result<()> {
    let config_path = super::config_path(cli.config.as_ref())?;
    show(ctx, &config_path, &paths::state_dir()?)
}

pub fn show(ctx: &Context, config_path: &Path, state_dir: &Path) -> Result<()> {
    let store = FileStateStore::new(state_dir);
    let state = store.load()?;

    // Config is optional here; it only adds steps that have never run
    let declared: Vec<String> = match ProvisionConfig::load(config_path) {
        Ok(config) => config.steps.into_iter().map(|s| s.id).collect(),
        Err(e) => {
            log::debug!("Status without config: {}", e);
            Vec::new()
        }
    };

    ui::header("Provision Status");
    ui::kv("State", &state_dir.display().to_string());
    ui::kv("Config", &config_path.display().to_string());
    ui::kv("Last run", state.last_run.as_deref().unwrap_or("never"));

    if let Some(run_id) = &state.last_run {
        let entries = store.history(Some(run_id))?;
        let attempted: BTreeSet<&str> = entries.iter().map(|e| e.step.as_str()).collect();
        ui::kv("Steps in last run", &attempted.len().to_string());
    }

    println!();
    for line in status_lines(&state, &declared) {
        let symbol = line
            .outcome
            .map_or_else(|| "·".dimmed(), ui::outcome_symbol);
        let label = match line.outcome {
            Some(outcome) => ui::outcome_label(outcome).to_string(),
            None => "never run".dimmed().to_string(),
        };
        let note = if line.removed {
            " (no longer declared)".dimmed().to_string()
        } else {
            String::new()
        };
        println!("  {} {:<24} {}{}", symbol, line.id, label, note);

        if ctx.verbose > 0 || matches!(line.outcome, Some(StepOutcome::Failed)) {
            if let Some(record) = state.get(&line.id) {
                if let Some(detail) = &record.detail {
                    ui::dim(&format!("    {detail}"));
                }
                ui::dim(&format!(
                    "    {} (run {})",
                    record.recorded_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    record.run_id
                ));
            }
        }
    }

    if state.is_empty() && declared.is_empty() {
        ui::dim("No steps recorded or declared");
    }

    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
struct StatusLine {
    id: String,
    outcome: Option<StepOutcome>,
    removed: bool,
}

/// Declared steps in config order, then recorded steps that were removed
fn status_lines(state: &RunState, declared: &[String]) -> Vec<StatusLine> {
    let mut lines: Vec<StatusLine> = declared
        .iter()
        .map(|id| StatusLine {
            id: id.clone(),
            outcome: state.get(id).map(|r| r.outcome),
            removed: false,
        })
        .collect();

    let declared: BTreeSet<&str> = declared.iter().map(String::as_str).collect();
    for (id, record) in &state.steps {
        if !declared.contains(id.as_str()) {
            lines.push(StatusLine {
                id: id.clone(),
                outcome: Some(record.outcome),
                // Without a config every recorded step would look removed
                removed: !declared.is_empty(),
            });
        }
    }

    lines
}
