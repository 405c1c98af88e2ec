//! Shallow git clones

use converge::{BackendError, CallContext};
use std::fs;
use std::path::Path;
use std::process::Command;

use crate::runner;

/// A destination counts as cloned once its `HEAD` resolves to a commit
///
/// `git clone` writes `.git/HEAD` before fetching, so a bare `.git` entry
/// is not enough; the branch ref only appears once the fetch completed.
pub fn is_cloned(dest: &Path) -> bool {
    let git_dir = dest.join(".git");
    let Ok(head) = fs::read_to_string(git_dir.join("HEAD")) else {
        return false;
    };
    let head = head.trim();

    match head.strip_prefix("ref:") {
        Some(refname) => {
            let refname = refname.trim();
            git_dir.join(refname).is_file()
                || fs::read_to_string(git_dir.join("packed-refs"))
                    .is_ok_and(|packed| packed.lines().any(|l| l.ends_with(refname)))
        }
        // Detached HEAD holds the commit id directly
        None => head.len() >= 40 && head.chars().all(|c| c.is_ascii_hexdigit()),
    }
}

pub fn clone(
    url: &str,
    dest: &Path,
    branch: Option<&str>,
    ctx: &CallContext,
) -> Result<(), BackendError> {
    if is_cloned(dest) {
        return Ok(());
    }

    let existed = dest.exists();
    if existed && !is_empty_dir(dest) {
        return Err(BackendError::permanent(format!(
            "clone destination {} exists and is not a git checkout",
            dest.display()
        )));
    }

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BackendError::permanent(format!("failed to create {}: {e}", parent.display()))
        })?;
    }

    let mut cmd = Command::new("git");
    cmd.args(["clone", "--depth", "1"]);
    if let Some(branch) = branch {
        cmd.args(["--branch", branch]);
    }
    cmd.arg(url).arg(dest);
    cmd.env("GIT_TERMINAL_PROMPT", "0");

    let result = runner::run(cmd, ctx).and_then(|output| {
        if output.success() {
            Ok(())
        } else {
            Err(output.into_error(&format!("git clone {url}")))
        }
    });

    // A failed or killed clone leaves a partial checkout that would block the retry
    if result.is_err() {
        discard_partial(dest, existed);
    }
    result
}

/// Undo a partial clone, keeping a destination directory we did not create
fn discard_partial(dest: &Path, existed: bool) {
    if !existed {
        if dest.exists() {
            if let Err(e) = fs::remove_dir_all(dest) {
                log::warn!("Failed to remove partial clone {}: {}", dest.display(), e);
            }
        }
        return;
    }

    let Ok(entries) = fs::read_dir(dest) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let removed = if path.is_dir() && !path.is_symlink() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        if let Err(e) = removed {
            log::warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path).is_ok_and(|mut entries| entries.next().is_none())
}
