//! System installer backend
//!
//! Binds step actions to the local machine: shell commands, the platform
//! package manager, git clones, files and symlinks. Every action can be
//! probed, so steps without an explicit `check` stay idempotent (except
//! bare commands, which have nothing to probe).

mod file;
mod git;
mod package;
mod symlink;

pub use package::PackageManager;

use converge::{Action, BackendError, CallContext, InstallerBackend, Step};

use crate::paths::Expander;
use crate::runner;

/// Settings the backend is constructed with
///
/// Home directory and exported variables are explicit here rather than
/// read ad hoc from the process environment.
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub shell: String,
    pub expander: Expander,
    pub package_manager: Option<PackageManager>,
}

/// Installer backend for the local machine
#[derive(Debug)]
pub struct SystemBackend {
    name: String,
    settings: BackendSettings,
    env: Vec<(String, String)>,
}

impl SystemBackend {
    pub fn new(settings: BackendSettings) -> Self {
        let name = match settings.package_manager {
            Some(pm) => format!("system/{}", pm.as_str()),
            None => "system".to_string(),
        };

        let mut env: Vec<(String, String)> = settings
            .expander
            .vars()
            .iter()
            .map(|(k, v)| (k.clone(), settings.expander.expand_str(v)))
            .collect();
        env.push((
            "HOME".to_string(),
            settings.expander.home().to_string_lossy().to_string(),
        ));

        Self {
            name,
            settings,
            env,
        }
    }

    fn expander(&self) -> &Expander {
        &self.settings.expander
    }

    fn package_manager(&self) -> Result<PackageManager, BackendError> {
        self.settings.package_manager.ok_or_else(|| {
            BackendError::permanent("no supported package manager found (brew or apt-get)")
        })
    }

    fn shell(&self, script: &str, ctx: &CallContext) -> Result<runner::CommandOutput, BackendError> {
        runner::run_shell(&self.settings.shell, script, &self.env, ctx)
    }

    fn probe_action(&self, action: &Action, ctx: &CallContext) -> Result<bool, BackendError> {
        match action {
            Action::Command { run } => Ok(self.shell(run, ctx)?.success()),
            Action::Package { name } => package::is_installed(self.package_manager()?, name, ctx),
            Action::GitClone { dest, .. } => Ok(git::is_cloned(&self.expander().expand_path(dest))),
            Action::Symlink { source, target } => symlink::is_linked(
                &self.expander().expand_path(source),
                &self.expander().expand_path(target),
            ),
            Action::File { path, contents } => {
                file::has_contents(&self.expander().expand_path(path), contents)
            }
        }
    }
}

impl InstallerBackend for SystemBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn probe(&self, step: &Step, ctx: &CallContext) -> Result<bool, BackendError> {
        match (&step.check, &step.apply) {
            (Some(check), _) => self.probe_action(check, ctx),
            // Nothing to observe; a bare command always runs
            (None, Action::Command { .. }) => Ok(false),
            (None, apply) => self.probe_action(apply, ctx),
        }
    }

    fn apply(&self, step: &Step, ctx: &CallContext) -> Result<(), BackendError> {
        match &step.apply {
            Action::Command { run } => {
                let output = self.shell(run, ctx)?;
                if output.success() {
                    Ok(())
                } else {
                    Err(output.into_error(&format!("step {}", step.id)))
                }
            }
            Action::Package { name } => package::install(self.package_manager()?, name, ctx),
            Action::GitClone { url, dest, branch } => git::clone(
                url,
                &self.expander().expand_path(dest),
                branch.as_deref(),
                ctx,
            ),
            Action::Symlink { source, target } => symlink::link(
                &self.expander().expand_path(source),
                &self.expander().expand_path(target),
            ),
            Action::File { path, contents } => {
                file::write(&self.expander().expand_path(path), contents)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn backend(home: &std::path::Path) -> SystemBackend {
        let mut vars = BTreeMap::new();
        vars.insert("PLUGIN_DIR".to_string(), "~/plugins".to_string());
        SystemBackend::new(BackendSettings {
            shell: "sh".to_string(),
            expander: Expander::new(home.to_path_buf(), vars),
            package_manager: None,
        })
    }

    #[test]
    fn test_command_check_uses_exit_status() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(tmp.path());
        let ctx = CallContext::unbounded();

        let step = Step::new("marker", Action::Command {
            run: "touch \"$HOME/marker\"".into(),
        })
        .with_check(Action::Command {
            run: "test -f \"$HOME/marker\"".into(),
        });

        assert!(!backend.probe(&step, &ctx).unwrap());
        backend.apply(&step, &ctx).unwrap();
        assert!(backend.probe(&step, &ctx).unwrap());
    }

    #[test]
    fn test_bare_command_is_never_satisfied() {
        let tmp = TempDir::new().unwrap();
        let step = Step::new("hello", Action::Command { run: "true".into() });
        assert!(!backend(tmp.path()).probe(&step, &CallContext::unbounded()).unwrap());
    }

    #[test]
    fn test_failing_command_is_classified() {
        let tmp = TempDir::new().unwrap();
        let step = Step::new("fetch", Action::Command {
            run: "echo 'curl: (6) Could not resolve host: example.com' >&2; exit 6".into(),
        });
        let err = backend(tmp.path())
            .apply(&step, &CallContext::unbounded())
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_configured_vars_are_exported_expanded() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(tmp.path());
        let step = Step::new("dir", Action::Command {
            run: "mkdir -p \"$PLUGIN_DIR\"".into(),
        });
        backend.apply(&step, &CallContext::unbounded()).unwrap();
        assert!(tmp.path().join("plugins").is_dir());
    }

    #[test]
    fn test_file_step_is_derived_probe() {
        let tmp = TempDir::new().unwrap();
        let backend = backend(tmp.path());
        let ctx = CallContext::unbounded();
        let step = Step::new("zshrc", Action::File {
            path: "~/.zshrc".into(),
            contents: "export ZSH=~/.oh-my-zsh\n".into(),
        });

        assert!(!backend.probe(&step, &ctx).unwrap());
        backend.apply(&step, &ctx).unwrap();
        assert!(backend.probe(&step, &ctx).unwrap());
    }

    #[test]
    fn test_package_without_manager_is_permanent() {
        let tmp = TempDir::new().unwrap();
        let step = Step::new("zsh", Action::Package { name: "zsh".into() });
        let err = backend(tmp.path())
            .probe(&step, &CallContext::unbounded())
            .unwrap_err();
        assert!(!err.is_retryable());
    }
}
