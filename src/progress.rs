//! Terminal progress for provisioning runs

use colored::Colorize;
use converge::{BackendError, ProgressCallback, Step, StepResult};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

use crate::ui;

/// Create a spinner with a message
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
            .template("{spinner:.cyan} {msg} {elapsed:.dim}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Spinner per step, replaced by a result line when the step completes
pub struct TerminalProgress {
    quiet: bool,
    current: Option<ProgressBar>,
    index: usize,
    total: usize,
}

impl TerminalProgress {
    pub fn new(quiet: bool) -> Self {
        Self {
            quiet,
            current: None,
            index: 0,
            total: 0,
        }
    }

    fn counter(&self) -> String {
        let width = self.total.to_string().len();
        format!("[{:>width$}/{}]", self.index, self.total)
    }

    fn print(&self, line: &str) {
        match &self.current {
            Some(pb) => pb.println(line),
            None => println!("{line}"),
        }
    }
}

impl ProgressCallback for TerminalProgress {
    fn on_run_start(&mut self, run_id: &str, total: usize) {
        self.total = total;
        if !self.quiet {
            println!(
                "{} {} {}",
                "Provisioning".bold(),
                format!("{total} step(s)").cyan(),
                format!("(run {run_id})").dimmed()
            );
        }
    }

    fn on_step_start(&mut self, index: usize, total: usize, step: &Step) {
        self.index = index;
        self.total = total;
        if !self.quiet {
            let msg = format!("{} {}", self.counter().blue(), step.describe());
            self.current = Some(spinner(&msg));
        }
    }

    fn on_retry(
        &mut self,
        step: &Step,
        attempt: u32,
        max_attempts: u32,
        error: &BackendError,
        delay: Duration,
    ) {
        if self.quiet {
            return;
        }
        self.print(&format!(
            "  {} {} attempt {}/{} failed: {} (retrying in {})",
            "↻".yellow(),
            step.id,
            attempt,
            max_attempts,
            error,
            ui::format_duration(delay)
        ));
    }

    fn on_step_complete(&mut self, step: &Step, result: &StepResult) {
        let pb = self.current.take();
        if let Some(pb) = &pb {
            pb.finish_and_clear();
        }

        let outcome = result.outcome();
        if self.quiet && result.is_success() {
            return;
        }

        let status = match result.detail() {
            Some(detail) => format!("{} {}", ui::outcome_label(outcome), detail.dimmed()),
            None => ui::outcome_label(outcome).to_string(),
        };
        let line = format!(
            "{} {} {} {}",
            self.counter().blue(),
            ui::outcome_symbol(outcome),
            step.id.bold(),
            status
        );
        if result.is_success() {
            println!("{line}");
        } else {
            eprintln!("{line}");
        }
    }
}
