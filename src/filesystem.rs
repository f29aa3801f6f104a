//! Filesystem side effects: directory lifecycle, recursive copies, and
//! permission normalisation. Permission handling is a no-op on platforms
//! without POSIX modes.

use crate::error::{self, Result};
use log::{debug, warn};
use snafu::{IntoError, ResultExt};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

pub(crate) const DIR_MODE: u32 = 0o755;
pub(crate) const FILE_MODE: u32 = 0o644;
pub(crate) const SCRIPT_MODE: u32 = 0o755;

/// Removes a directory tree if it exists. Best effort: a partially removable
/// tree is logged and left behind rather than failing the run.
pub(crate) fn cleanup_dir<P: AsRef<Path>>(path: P) {
    let path = path.as_ref();
    if path.exists() {
        match fs::remove_dir_all(path) {
            Ok(()) => debug!("Removed directory: {}", path.display()),
            Err(e) => warn!("Could not remove {}: {}", path.display(), e),
        }
    }
}

pub(crate) fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    fs::create_dir_all(path).context(error::CreateDirSnafu { path })
}

#[cfg(unix)]
pub(crate) fn set_permissions<P: AsRef<Path>>(path: P, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    let path = path.as_ref();
    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode)) {
        warn!("Could not set permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
pub(crate) fn set_permissions<P: AsRef<Path>>(_path: P, _mode: u32) {}

/// Walks `root` and normalises modes: directories 0755, regular files 0644,
/// shell scripts 0755.
pub(crate) fn set_tree_permissions<P: AsRef<Path>>(root: P) {
    let root = root.as_ref();
    if !root.exists() {
        return;
    }

    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if entry.file_type().is_dir() {
            set_permissions(path, DIR_MODE);
        } else if entry.file_type().is_file() {
            let mode = if path.extension().map(|e| e == "sh").unwrap_or(false) {
                SCRIPT_MODE
            } else {
                FILE_MODE
            };
            set_permissions(path, mode);
        }
    }
}

/// Recursively copies `src` into `dst`, overwriting files that already exist.
pub(crate) fn copy_tree<P: AsRef<Path>, Q: AsRef<Path>>(src: P, dst: Q) -> Result<()> {
    let src = src.as_ref();
    let dst = dst.as_ref();
    create_dir_all(dst)?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| {
            error::ReadFileSnafu { path: src }.into_error(std::io::Error::from(e))
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dst.join(relative);

        if entry.file_type().is_dir() {
            create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target).context(error::CopySnafu {
                from: entry.path().to_path_buf(),
                to: target.clone(),
            })?;
        }
    }

    Ok(())
}
