//! Platform package manager (Homebrew or apt)

use converge::{BackendError, CallContext};
use std::process::Command;

use crate::runner;

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Brew,
    Apt,
}

impl PackageManager {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Brew => "brew",
            Self::Apt => "apt",
        }
    }

    /// Pick the first package manager available on PATH, preferring brew
    pub fn detect() -> Option<Self> {
        if runner::command_exists("brew") {
            Some(Self::Brew)
        } else if runner::command_exists("apt-get") && runner::command_exists("dpkg-query") {
            Some(Self::Apt)
        } else {
            None
        }
    }
}

/// Check whether `name` is installed
pub fn is_installed(pm: PackageManager, name: &str, ctx: &CallContext) -> Result<bool, BackendError> {
    match pm {
        PackageManager::Brew => {
            let mut cmd = Command::new("brew");
            cmd.args(["list", "--versions", name]);
            let output = runner::run(cmd, ctx)?;
            // Unknown formulae exit non-zero; install reports the real error
            Ok(output.success() && brew_versions_listed(&output.stdout))
        }
        PackageManager::Apt => {
            let mut cmd = Command::new("dpkg-query");
            cmd.args(["-W", "-f=${Status}", name]);
            let output = runner::run(cmd, ctx)?;
            Ok(output.success() && dpkg_status_installed(&output.stdout))
        }
    }
}

/// Install `name`
pub fn install(pm: PackageManager, name: &str, ctx: &CallContext) -> Result<(), BackendError> {
    let cmd = match pm {
        PackageManager::Brew => {
            let mut cmd = Command::new("brew");
            cmd.args(["install", name]);
            cmd.env("HOMEBREW_NO_AUTO_UPDATE", "1");
            cmd
        }
        PackageManager::Apt => {
            let mut cmd = if is_root() {
                Command::new("apt-get")
            } else {
                let mut sudo = Command::new("sudo");
                sudo.args(["-n", "apt-get"]);
                sudo
            };
            cmd.args(["install", "-y", "--no-install-recommends", name]);
            cmd.env("DEBIAN_FRONTEND", "noninteractive");
            cmd
        }
    };

    log::info!("Installing {} via {}", name, pm.as_str());
    let output = runner::run(cmd, ctx)?;
    if output.success() {
        Ok(())
    } else {
        Err(output.into_error(&format!("{} install {name}", pm.as_str())))
    }
}

fn brew_versions_listed(stdout: &str) -> bool {
    stdout
        .lines()
        .any(|line| line.split_whitespace().nth(1).is_some())
}

fn dpkg_status_installed(status: &str) -> bool {
    status.trim() == "install ok installed"
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}
