mod backend;
mod cli;
mod commands;
mod config;
mod paths;
mod progress;
mod runner;
mod signal;
mod ui;

use clap::Parser;
use cli::Cli;
use config::ConfigError;
use converge::{PlanError, RegistryError};
use std::process::ExitCode;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
}

/// Configuration, registry or plan problems; nothing was touched
const EXIT_CONFIG: u8 = 2;
/// Anything else that stopped the run (state store, lock, I/O)
const EXIT_FATAL: u8 = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
    };

    let result = if cli.status {
        commands::status::run(&ctx, &cli).map(|()| commands::RunOutcome::Success)
    } else {
        commands::provision::run(&ctx, &cli)
    };

    match result {
        Ok(outcome) => ExitCode::from(outcome.exit_code()),
        Err(err) => {
            ui::error(&format!("{err:#}"));
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    let is_config = err.chain().any(|cause| {
        cause.is::<ConfigError>() || cause.is::<RegistryError>() || cause.is::<PlanError>()
    });
    if is_config { EXIT_CONFIG } else { EXIT_FATAL }
}
