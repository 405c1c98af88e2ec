//! Centralized path resolution for provision
//!
//! # Environment Variables
//!
//! - `PROVISION_CONFIG_DIR` - Override config directory (e.g., `~/dotfiles/provision`)
//! - `PROVISION_STATE_DIR` - Override state directory
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `PROVISION_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/provision` (if set)
//! 3. `~/.config/provision`
//!
//! For state_dir():
//! 1. `PROVISION_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/provision` (if set)
//! 3. `~/.local/state/provision`

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "PROVISION_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "PROVISION_STATE_DIR";

const APP_DIR: &str = "provision";

/// Config file name inside the config directory
pub const CONFIG_FILE: &str = "provision.toml";

/// Lock file name inside the state directory
pub const LOCK_FILE: &str = "provision.lock";

/// Get the provision config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = resolve_dir(
        std::env::var(ENV_CONFIG_DIR).ok(),
        std::env::var("XDG_CONFIG_HOME").ok(),
        &home.join(".config"),
    );
    log::debug!("Using config dir: {}", path.display());
    Ok(path)
}

/// Get the provision state directory path
pub fn state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    let path = resolve_dir(
        std::env::var(ENV_STATE_DIR).ok(),
        std::env::var("XDG_STATE_HOME").ok(),
        &home.join(".local").join("state"),
    );
    log::debug!("Using state dir: {}", path.display());
    Ok(path)
}

/// Default config file path
pub fn default_config_file() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE))
}

fn resolve_dir(override_dir: Option<String>, xdg_base: Option<String>, fallback: &Path) -> PathBuf {
    if let Some(dir) = override_dir.filter(|d| !d.is_empty()) {
        return expand(&dir);
    }
    if let Some(base) = xdg_base.filter(|d| !d.is_empty()) {
        return PathBuf::from(base).join(APP_DIR);
    }
    fallback.join(APP_DIR)
}

/// Expand ~ and environment variables in a path string.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}

/// Expands paths against an explicit home and variable set
///
/// Backends use this instead of the process environment so a run is fully
/// described by its configuration. Variables missing from `vars` fall back
/// to the process environment; unknown ones are left as-is.
#[derive(Debug, Clone)]
pub struct Expander {
    home: PathBuf,
    vars: BTreeMap<String, String>,
}

impl Expander {
    /// A leading `~` in a variable value is resolved against `home` up front
    pub fn new(home: PathBuf, vars: BTreeMap<String, String>) -> Self {
        let home_str = home.to_string_lossy().to_string();
        let vars = vars
            .into_iter()
            .map(|(name, value)| {
                let value = shellexpand::tilde_with_context(&value, || Some(home_str.as_str()))
                    .into_owned();
                (name, value)
            })
            .collect();
        Self { home, vars }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn expand_str(&self, input: &str) -> String {
        let home = self.home.to_string_lossy().to_string();
        shellexpand::full_with_context_no_errors(
            input,
            || Some(home.clone()),
            |name: &str| -> Option<String> {
                if name == "HOME" {
                    return Some(home.clone());
                }
                self.vars
                    .get(name)
                    .cloned()
                    .or_else(|| std::env::var(name).ok())
            },
        )
        .into_owned()
    }

    pub fn expand_path(&self, input: &str) -> PathBuf {
        PathBuf::from(self.expand_str(input))
    }
}
