use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "provision")]
#[command(version)]
#[command(about = "Bring a machine to its declared state, idempotently and resumably", long_about = None)]
pub struct Cli {
    /// Config file (default: <config dir>/provision.toml)
    #[arg(short, long, env = "PROVISION_CONFIG", value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the execution order without touching the machine
    #[arg(long)]
    pub plan_only: bool,

    /// Forget recorded state before running
    #[arg(long)]
    pub reset: bool,

    /// Run only these steps and their dependencies (repeatable)
    #[arg(short, long = "step", value_name = "ID")]
    pub steps: Vec<String>,

    /// Skip probing steps recorded as succeeded with an unchanged definition
    #[arg(long)]
    pub trust_state: bool,

    /// Per-step timeout in seconds (overrides the config)
    #[arg(long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..))]
    pub step_timeout: Option<u64>,

    /// Show recorded state and exit
    #[arg(long, conflicts_with_all = ["plan_only", "reset"])]
    pub status: bool,

    /// Verbosity level (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,
}
