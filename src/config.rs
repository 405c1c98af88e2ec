//! provision.toml loading and validation

use converge::{Action, ExecuteOptions, Registry, RegistryError, RetryConfig, Step};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use thiserror::Error;

use crate::backend::{BackendSettings, PackageManager};
use crate::paths::{self, Expander};

static STEP_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("valid regex"));

/// Errors loading or validating the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid step id {0:?}: use letters, digits, '.', '_' or '-', starting with a letter or digit")]
    InvalidStepId(String),

    #[error("invalid setting {key}: {message}")]
    InvalidSetting { key: &'static str, message: String },

    #[error("could not determine home directory")]
    NoHome,
}

/// Which package manager the backend binds to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManagerChoice {
    #[default]
    Auto,
    Brew,
    Apt,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub step_timeout_secs: u64,
    pub shell: String,
    pub package_manager: PackageManagerChoice,
    pub trust_state: bool,
    /// Home directory used for `~` and `$HOME`; defaults to the user's home
    pub home: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            step_timeout_secs: 600,
            shell: "sh".to_string(),
            package_manager: PackageManagerChoice::Auto,
            trust_state: false,
            home: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

/// Parsed provision.toml
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Variables exported to every step and used for path expansion
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl ProvisionConfig {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        log::debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content, path)
    }

    /// Parse and validate config text; `origin` is only used in messages
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.step_timeout_secs == 0 {
            return Err(invalid("settings.step_timeout_secs", "must be at least 1"));
        }
        if self.settings.shell.trim().is_empty() {
            return Err(invalid("settings.shell", "must not be empty"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            return Err(invalid("retry.backoff_factor", "must be a number >= 1.0"));
        }

        for step in &self.steps {
            if !STEP_ID_RE.is_match(&step.id) {
                return Err(ConfigError::InvalidStepId(step.id.clone()));
            }
            if step.check.is_none() && matches!(step.apply, Action::Command { .. }) {
                log::warn!(
                    "Step '{}' runs a command without a check; it will re-run every time",
                    step.id
                );
            }
        }

        Ok(())
    }

    /// Build the step registry, checking ids and dependencies
    pub fn registry(&self) -> Result<Registry, RegistryError> {
        Registry::from_steps(self.steps.iter().cloned())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            backoff_factor: self.retry.backoff_factor,
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
        }
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.step_timeout_secs)
    }

    /// Executor options from settings; the caller overlays CLI flags
    pub fn execute_options(&self) -> ExecuteOptions {
        ExecuteOptions {
            step_timeout: self.step_timeout(),
            retry: self.retry_config(),
            trust_state: self.settings.trust_state,
            ..ExecuteOptions::default()
        }
    }

    pub fn home_dir(&self) -> Result<PathBuf, ConfigError> {
        match self.settings.home.as_deref() {
            Some(home) if !home.is_empty() => Ok(paths::expand(home)),
            _ => dirs::home_dir().ok_or(ConfigError::NoHome),
        }
    }

    pub fn expander(&self) -> Result<Expander, ConfigError> {
        Ok(Expander::new(self.home_dir()?, self.env.clone()))
    }

    /// Backend settings, resolving `package_manager = "auto"` against PATH
    pub fn backend_settings(&self) -> Result<BackendSettings, ConfigError> {
        let package_manager = match self.settings.package_manager {
            PackageManagerChoice::Auto => {
                let detected = PackageManager::detect();
                match detected {
                    Some(pm) => log::debug!("Detected package manager: {}", pm.as_str()),
                    None => log::debug!("No package manager detected"),
                }
                detected
            }
            PackageManagerChoice::Brew => Some(PackageManager::Brew),
            PackageManagerChoice::Apt => Some(PackageManager::Apt),
        };

        Ok(BackendSettings {
            shell: self.settings.shell.clone(),
            expander: self.expander()?,
            package_manager,
        })
    }
}

fn invalid(key: &'static str, message: &str) -> ConfigError {
    ConfigError::InvalidSetting {
        key,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::Category;

    const SAMPLE: &str = r#"
[settings]
step_timeout_secs = 120
package_manager = "brew"
home = "/home/dev"

[retry]
max_attempts = 5
base_delay_ms = 10

[env]
ZSH = "~/.oh-my-zsh"

[[step]]
id = "zsh"
category = "package"
apply = { type = "package", name = "zsh" }

[[step]]
id = "oh-my-zsh"
category = "shell-plugin"
depends_on = ["zsh"]
apply = { type = "git_clone", url = "https://github.com/ohmyzsh/ohmyzsh", dest = "$ZSH" }

[[step]]
id = "zshrc"
category = "file"
depends_on = ["oh-my-zsh"]
check = { type = "command", run = "grep -q plugins ~/.zshrc" }
apply = { type = "file", path = "~/.zshrc", contents = "plugins=(git)\n" }
"#;

    fn parse(text: &str) -> Result<ProvisionConfig, ConfigError> {
        ProvisionConfig::parse(text, Path::new("provision.toml"))
    }

    #[test]
    fn test_parse_sample() {
        let config = parse(SAMPLE).unwrap();

        assert_eq!(config.settings.step_timeout_secs, 120);
        assert_eq!(config.settings.shell, "sh");
        assert_eq!(config.settings.package_manager, PackageManagerChoice::Brew);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.steps.len(), 3);
        assert_eq!(config.steps[1].depends_on, vec!["zsh".to_string()]);
        assert_eq!(config.steps[1].category, Category::ShellPlugin);
        assert!(config.steps[2].check.is_some());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = parse("").unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.retry_config(), RetryConfig::default());
        assert_eq!(config.step_timeout(), Duration::from_secs(600));
        assert!(config.registry().unwrap().is_empty());
    }

    #[test]
    fn test_registry_from_config() {
        let registry = parse(SAMPLE).unwrap().registry().unwrap();
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.position("zshrc"), Some(2));
    }

    #[test]
    fn test_unknown_dependency_surfaces_as_registry_error() {
        let config = parse(
            r#"
[[step]]
id = "b"
depends_on = ["a"]
apply = { type = "command", run = "true" }
"#,
        )
        .unwrap();
        assert!(matches!(
            config.registry(),
            Err(RegistryError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_invalid_step_id() {
        let err = parse(
            r#"
[[step]]
id = "../escape"
apply = { type = "command", run = "true" }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStepId(ref id) if id == "../escape"));
    }

    #[test]
    fn test_invalid_retry_settings() {
        let err = parse("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting { key: "retry.max_attempts", .. }
        ));

        let err = parse("[retry]\nbackoff_factor = 0.5\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting { key: "retry.backoff_factor", .. }
        ));
    }

    #[test]
    fn test_unknown_action_type_is_parse_error() {
        let err = parse(
            r#"
[[step]]
id = "x"
apply = { type = "teleport" }
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_execute_options_from_settings() {
        let config = parse("[settings]\ntrust_state = true\nstep_timeout_secs = 5\n").unwrap();
        let opts = config.execute_options();
        assert!(opts.trust_state);
        assert_eq!(opts.step_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_backend_settings_use_configured_home() {
        let config = parse(SAMPLE).unwrap();
        let settings = config.backend_settings().unwrap();
        assert_eq!(settings.package_manager, Some(PackageManager::Brew));
        assert_eq!(
            settings.expander.expand_str("$ZSH"),
            "/home/dev/.oh-my-zsh"
        );
    }

    #[test]
    fn test_load_missing_file() {
        let err = ProvisionConfig::load(Path::new("/nonexistent/provision.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
