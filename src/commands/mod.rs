pub mod provision;
pub mod status;

use anyhow::Result;
use std::path::PathBuf;

use crate::paths;

/// How a completed command should exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    /// At least one step failed or was blocked
    StepsFailed,
    /// Cancelled between steps with no failures so far
    Interrupted,
}

impl RunOutcome {
    pub const fn exit_code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::StepsFailed => 1,
            Self::Interrupted => 130,
        }
    }
}

/// Config file from `--config`, else the default location
pub fn config_path(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.clone()),
        None => paths::default_config_file(),
    }
}
