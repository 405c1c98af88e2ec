//! Symlink actions

use converge::BackendError;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, PartialEq, Eq)]
enum LinkState {
    Missing,
    Correct,
    WrongTarget(PathBuf),
    OtherFile,
}

fn current_state(source: &Path, target: &Path) -> Result<LinkState, BackendError> {
    if !target.is_symlink() {
        return Ok(if target.exists() {
            LinkState::OtherFile
        } else {
            LinkState::Missing
        });
    }

    let link = fs::read_link(target).map_err(|e| {
        BackendError::permanent(format!("failed to read symlink {}: {e}", target.display()))
    })?;

    let expected = source.canonicalize().unwrap_or_else(|_| source.to_path_buf());
    let resolved = if link.is_absolute() {
        link
    } else {
        target.parent().map_or(link.clone(), |p| p.join(&link))
    };
    let actual = resolved.canonicalize().unwrap_or(resolved);

    if expected == actual {
        Ok(LinkState::Correct)
    } else {
        Ok(LinkState::WrongTarget(actual))
    }
}

/// Whether `target` is a symlink resolving to `source`
pub fn is_linked(source: &Path, target: &Path) -> Result<bool, BackendError> {
    Ok(current_state(source, target)? == LinkState::Correct)
}

/// Create `target -> source`, replacing a symlink that points elsewhere
///
/// A regular file or directory at `target` is never overwritten.
pub fn link(source: &Path, target: &Path) -> Result<(), BackendError> {
    match current_state(source, target)? {
        LinkState::Correct => return Ok(()),
        LinkState::OtherFile => {
            return Err(BackendError::permanent(format!(
                "refusing to replace existing file at {}",
                target.display()
            )));
        }
        LinkState::WrongTarget(actual) => {
            log::info!(
                "Relinking {} (was -> {})",
                target.display(),
                actual.display()
            );
            fs::remove_file(target).map_err(|e| {
                BackendError::permanent(format!(
                    "failed to remove symlink {}: {e}",
                    target.display()
                ))
            })?;
        }
        LinkState::Missing => {}
    }

    if !source.exists() {
        return Err(BackendError::permanent(format!(
            "symlink source does not exist: {}",
            source.display()
        )));
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            BackendError::permanent(format!("failed to create {}: {e}", parent.display()))
        })?;
    }

    create(source, target).map_err(|e| {
        BackendError::permanent(format!(
            "failed to create symlink {} -> {}: {e}",
            target.display(),
            source.display()
        ))
    })
}

#[cfg(unix)]
fn create(source: &Path, target: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(source, target)
}

#[cfg(windows)]
fn create(source: &Path, target: &Path) -> std::io::Result<()> {
    if source.is_dir() {
        std::os::windows::fs::symlink_dir(source, target)
    } else {
        std::os::windows::fs::symlink_file(source, target)
    }
}
