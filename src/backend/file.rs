//! Managed file contents

use converge::BackendError;
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn has_contents(path: &Path, contents: &str) -> Result<bool, BackendError> {
    match fs::read(path) {
        Ok(existing) => Ok(existing == contents.as_bytes()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(BackendError::permanent(format!(
            "failed to read {}: {e}",
            path.display()
        ))),
    }
}

/// Write `contents` to `path` via a temp file and rename
pub fn write(path: &Path, contents: &str) -> Result<(), BackendError> {
    let io_err = |what: &str, e: std::io::Error| {
        BackendError::permanent(format!("failed to {what} {}: {e}", path.display()))
    };

    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|e| io_err("create parent of", e))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| BackendError::permanent(format!("not a file path: {}", path.display())))?;
    let tmp = parent.join(format!(".{}.provision-tmp", file_name.to_string_lossy()));

    {
        let mut file = fs::File::create(&tmp).map_err(|e| io_err("create temp file for", e))?;
        file.write_all(contents.as_bytes())
            .map_err(|e| io_err("write", e))?;
        file.sync_all().map_err(|e| io_err("sync", e))?;
    }

    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err("replace", e)
    })
}
