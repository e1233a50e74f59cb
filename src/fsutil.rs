//! Filesystem primitives with user-mediated retry.
//!
//! Windows-style file locking (antivirus scanners, the game still holding
//! a handle) makes directory removal and renames fail transiently. Those
//! operations go through a [`Prompter`] so the user can retry after
//! closing the offending process, or cancel the whole stage.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// User decision for a failed filesystem operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryChoice {
    Retry,
    Cancel,
}

/// Confirmation/prompt provider.
///
/// The core asks exactly two kinds of questions: "retry this filesystem
/// operation?" and "re-update an already current build?". Everything else
/// is reported, never asked.
pub trait Prompter: Send + Sync {
    /// A removal/rename failed, most likely because another process holds
    /// a handle on `path`.
    fn retry_fs_operation(&self, path: &Path, error: &io::Error) -> RetryChoice;

    /// The installed build already matches the selected one.
    fn confirm_reupdate(&self) -> bool;
}

/// Non-interactive prompter: never retries, always confirms.
///
/// The right default for unattended runs and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl Prompter for NoPrompt {
    fn retry_fs_operation(&self, _path: &Path, _error: &io::Error) -> RetryChoice {
        RetryChoice::Cancel
    }

    fn confirm_reupdate(&self) -> bool {
        true
    }
}

/// Recursively remove a directory, clearing read-only bits when a first
/// attempt fails. Game archives occasionally ship read-only files that
/// `remove_dir_all` refuses to delete.
pub fn force_remove_dir_all(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(first) => {
            debug!(
                "remove_dir_all failed for {}: {first}; clearing read-only bits",
                path.display()
            );
            for entry in WalkDir::new(path).into_iter().filter_map(|e| e.ok()) {
                if let Ok(metadata) = entry.metadata() {
                    let mut permissions = metadata.permissions();
                    if permissions.readonly() {
                        permissions.set_readonly(false);
                        let _ = fs::set_permissions(entry.path(), permissions);
                    }
                }
            }
            fs::remove_dir_all(path)
        }
    }
}

/// Remove a directory tree, asking the user to retry on failure.
///
/// Returns `Ok(true)` once the directory is gone and `Ok(false)` if the
/// user cancelled while it still exists.
pub fn retry_remove_dir(path: &Path, prompt: &dyn Prompter) -> Result<bool> {
    while path.is_dir() {
        match force_remove_dir_all(path) {
            Ok(()) => {}
            Err(error) => {
                warn!("failed to remove {}: {error}", path.display());
                if prompt.retry_fs_operation(path, &error) == RetryChoice::Cancel {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Delete a single file, asking the user to retry on failure.
pub fn retry_remove_file(path: &Path, prompt: &dyn Prompter) -> Result<bool> {
    while path.is_file() {
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(error) => {
                warn!("failed to delete {}: {error}", path.display());
                if prompt.retry_fs_operation(path, &error) == RetryChoice::Cancel {
                    return Ok(false);
                }
            }
        }
    }
    Ok(true)
}

/// Move a directory entry (file or tree) into `dst_dir`, keeping its
/// file name. Falls back to copy-and-delete when a plain rename fails,
/// e.g. across filesystems.
pub fn move_entry(src: &Path, dst_dir: &Path) -> io::Result<PathBuf> {
    let name = src.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("cannot move path without a file name: {}", src.display()),
        )
    })?;
    let dst = dst_dir.join(name);

    match fs::rename(src, &dst) {
        Ok(()) => Ok(dst),
        Err(rename_error) => {
            debug!(
                "rename {} -> {} failed ({rename_error}); copying instead",
                src.display(),
                dst.display()
            );
            if src.is_dir() {
                copy_dir_recursive(src, &dst)?;
                force_remove_dir_all(src)?;
            } else {
                fs::copy(src, &dst)?;
                fs::remove_file(src)?;
            }
            Ok(dst)
        }
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Allocate a fresh uniquely named scratch directory under the
/// launcher's temp area. The caller owns its lifetime; nothing is
/// deleted on drop.
pub fn scratch_dir(prefix: &str) -> Result<PathBuf> {
    let base = std::env::temp_dir().join("catapult");
    fs::create_dir_all(&base)
        .with_context(|| format!("Failed to create temp directory: {}", base.display()))?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{prefix}-"))
        .tempdir_in(&base)
        .with_context(|| format!("Failed to create scratch directory under {}", base.display()))?;
    Ok(dir.keep())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn force_remove_clears_readonly_entries() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("tree");
        fs::create_dir_all(dir.join("sub")).unwrap();
        let file = dir.join("sub").join("locked.txt");
        fs::write(&file, b"data").unwrap();
        let mut perms = fs::metadata(&file).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&file, perms).unwrap();

        force_remove_dir_all(&dir).unwrap();
        assert!(!dir.exists());
    }

    #[test]
    fn retry_remove_dir_is_noop_when_missing() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("not_there");
        assert!(retry_remove_dir(&missing, &NoPrompt).unwrap());
    }

    #[test]
    fn move_entry_moves_files_and_directories() {
        let temp = TempDir::new().unwrap();
        let src_file = temp.path().join("a.txt");
        fs::write(&src_file, b"hello").unwrap();
        let dst_dir = temp.path().join("dest");
        fs::create_dir(&dst_dir).unwrap();

        let moved = move_entry(&src_file, &dst_dir).unwrap();
        assert!(!src_file.exists());
        assert_eq!(fs::read(moved).unwrap(), b"hello");

        let src_dir = temp.path().join("tree");
        fs::create_dir_all(src_dir.join("nested")).unwrap();
        fs::write(src_dir.join("nested").join("b.txt"), b"world").unwrap();
        let moved = move_entry(&src_dir, &dst_dir).unwrap();
        assert!(!src_dir.exists());
        assert_eq!(fs::read(moved.join("nested").join("b.txt")).unwrap(), b"world");
    }

    #[test]
    fn scratch_dirs_are_unique() {
        let a = scratch_dir("unit").unwrap();
        let b = scratch_dir("unit").unwrap();
        assert_ne!(a, b);
        fs::remove_dir_all(a).unwrap();
        fs::remove_dir_all(b).unwrap();
    }
}
