//! Backup and restore of the current installation.
//!
//! Backing up means moving (not copying) every entry of the game
//! directory into a `previous_version` sidecar, one entry at a time so
//! progress can be reported and cancellation observed between entries.
//! Restore is the universal unwind: it moves the sidecar's contents back
//! and removes the sidecar, and is a no-op when there is nothing to
//! restore.
//!
//! Three entries are never moved by generic enumeration: the sidecar
//! itself, the `save` subtree when save preservation is configured, and
//! the launcher's own executable when it lives inside the game
//! directory.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::UpdateOptions;
use crate::fsutil::{self, Prompter};
use crate::game_dir::PREVIOUS_VERSION_DIR;
use crate::progress::{CancelFlag, ProgressEvent, ProgressFn};

/// Result of the backup stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupOutcome {
    /// All entries moved; the sidecar may be absent when there was
    /// nothing to back up.
    Completed,
    /// Cancelled by the user, either through the cancel flag or by
    /// declining to retry the sidecar removal.
    Aborted,
}

/// Entries excluded from generic move/backup enumeration.
fn excluded_entries(game_dir: &Path, options: &UpdateOptions) -> HashSet<OsString> {
    let mut excluded: HashSet<OsString> = HashSet::new();
    excluded.insert(OsString::from(PREVIOUS_VERSION_DIR));
    if options.prevent_save_move {
        excluded.insert(OsString::from("save"));
    }
    if let Some(name) = colocated_launcher_name(game_dir) {
        excluded.insert(name);
    }
    excluded
}

/// Name of the launcher executable when it sits inside `game_dir`.
fn colocated_launcher_name(game_dir: &Path) -> Option<OsString> {
    let exe = std::env::current_exe().ok()?;
    let exe_dir = exe.parent()?;
    let same = match (exe_dir.canonicalize(), game_dir.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => exe_dir == game_dir,
    };
    if same {
        exe.file_name().map(OsString::from)
    } else {
        None
    }
}

/// Move the current installation into a fresh `previous_version`
/// sidecar.
///
/// A pre-existing sidecar is removed first through the retry prompt;
/// declining counts as an abort. A failed move surfaces the OS error as
/// `Err` and leaves already-moved entries where they are — the caller
/// decides whether to restore.
pub fn backup_current(
    game_dir: &Path,
    options: &UpdateOptions,
    prompt: &dyn Prompter,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<BackupOutcome> {
    let backup_dir = game_dir.join(PREVIOUS_VERSION_DIR);

    if backup_dir.is_dir() {
        progress(ProgressEvent::Status {
            message: format!("Deleting {PREVIOUS_VERSION_DIR} directory"),
        });
        if !fsutil::retry_remove_dir(&backup_dir, prompt)? {
            return Ok(BackupOutcome::Aborted);
        }
    }

    let excluded = excluded_entries(game_dir, options);
    let mut entries: Vec<OsString> = Vec::new();
    for entry in fs::read_dir(game_dir)
        .with_context(|| format!("Failed to list game directory: {}", game_dir.display()))?
    {
        let entry = entry.context("Failed to list game directory")?;
        if !excluded.contains(&entry.file_name()) {
            entries.push(entry.file_name());
        }
    }
    entries.sort();

    if entries.is_empty() {
        debug!("nothing to back up in {}", game_dir.display());
        return Ok(BackupOutcome::Completed);
    }

    info!("backing up {} entries into {}", entries.len(), backup_dir.display());
    fs::create_dir_all(&backup_dir)
        .with_context(|| format!("Failed to create backup dir: {}", backup_dir.display()))?;

    let total = entries.len();
    for (index, name) in entries.iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(BackupOutcome::Aborted);
        }
        progress(ProgressEvent::BackupEntry {
            index,
            total,
            name: name.to_string_lossy().into_owned(),
        });
        fsutil::move_entry(&game_dir.join(name), &backup_dir).with_context(|| {
            format!("Failed to back up '{}'", Path::new(name).display())
        })?;
    }

    Ok(BackupOutcome::Completed)
}

/// Move the sidecar's contents back into the game directory and remove
/// the sidecar. Idempotent: a missing sidecar is a no-op.
pub fn restore_backup(
    game_dir: &Path,
    options: &UpdateOptions,
    prompt: &dyn Prompter,
) -> Result<()> {
    let backup_dir = game_dir.join(PREVIOUS_VERSION_DIR);
    if !backup_dir.is_dir() || !game_dir.is_dir() {
        return Ok(());
    }

    info!("restoring backup from {}", backup_dir.display());
    for entry in fs::read_dir(&backup_dir)
        .with_context(|| format!("Failed to list backup dir: {}", backup_dir.display()))?
    {
        let entry = entry.context("Failed to list backup dir")?;
        if options.prevent_save_move && entry.file_name() == "save" {
            continue;
        }
        fsutil::move_entry(&entry.path(), game_dir)
            .with_context(|| format!("Failed to restore '{}'", entry.path().display()))?;
    }

    fsutil::retry_remove_dir(&backup_dir, prompt)?;
    Ok(())
}

/// Move everything currently in the game directory (minus exclusions)
/// into a scratch area, clearing the way for a restore.
///
/// Returns `None` when the directory holds nothing but the sidecar.
pub fn clean_game_dir(game_dir: &Path, options: &UpdateOptions) -> Result<Option<PathBuf>> {
    let mut names: Vec<OsString> = Vec::new();
    for entry in fs::read_dir(game_dir)
        .with_context(|| format!("Failed to list game directory: {}", game_dir.display()))?
    {
        names.push(entry.context("Failed to list game directory")?.file_name());
    }
    if names.is_empty() || (names.len() == 1 && names[0] == PREVIOUS_VERSION_DIR) {
        return Ok(None);
    }

    let scratch = fsutil::scratch_dir("moved")?;
    let excluded = excluded_entries(game_dir, options);
    for name in names {
        if !excluded.contains(&name) {
            fsutil::move_entry(&game_dir.join(&name), &scratch).with_context(|| {
                format!("Failed to move aside '{}'", Path::new(&name).display())
            })?;
        }
    }
    Ok(Some(scratch))
}

/// Merge displaced content back into the sidecar, so nothing moved
/// aside by [`clean_game_dir`] is lost. Consumes the scratch directory.
pub fn restore_previous_content(game_dir: &Path, scratch: Option<&Path>) -> Result<()> {
    let Some(scratch) = scratch else {
        return Ok(());
    };
    let backup_dir = game_dir.join(PREVIOUS_VERSION_DIR);
    if !backup_dir.exists() {
        fs::create_dir_all(&backup_dir)
            .with_context(|| format!("Failed to create: {}", backup_dir.display()))?;
    }
    for entry in fs::read_dir(scratch)
        .with_context(|| format!("Failed to list scratch dir: {}", scratch.display()))?
    {
        let entry = entry.context("Failed to list scratch dir")?;
        fsutil::move_entry(&entry.path(), &backup_dir)
            .with_context(|| format!("Failed to stash '{}'", entry.path().display()))?;
    }
    fs::remove_dir(scratch)
        .with_context(|| format!("Failed to remove scratch dir: {}", scratch.display()))?;
    Ok(())
}

/// User-triggered "restore previous version": swap the current build
/// with the sidecar's, leaving the replaced build in the sidecar.
///
/// Returns `false` when there is no previous version to restore.
pub fn swap_with_previous(
    game_dir: &Path,
    options: &UpdateOptions,
    prompt: &dyn Prompter,
) -> Result<bool> {
    let previous_dir = game_dir.join(PREVIOUS_VERSION_DIR);
    if !previous_dir.is_dir() || !game_dir.is_dir() {
        return Ok(false);
    }

    let scratch = fsutil::scratch_dir("moved")?;
    let excluded = excluded_entries(game_dir, options);
    for entry in fs::read_dir(game_dir)
        .with_context(|| format!("Failed to list game directory: {}", game_dir.display()))?
    {
        let entry = entry.context("Failed to list game directory")?;
        if !excluded.contains(&entry.file_name()) {
            fsutil::move_entry(&entry.path(), &scratch)?;
        }
    }

    for entry in fs::read_dir(&previous_dir)
        .with_context(|| format!("Failed to list: {}", previous_dir.display()))?
    {
        let entry = entry.context("Failed to list previous version")?;
        if options.prevent_save_move && entry.file_name() == "save" {
            continue;
        }
        fsutil::move_entry(&entry.path(), game_dir)?;
    }

    for entry in fs::read_dir(&scratch)
        .with_context(|| format!("Failed to list scratch dir: {}", scratch.display()))?
    {
        let entry = entry.context("Failed to list scratch dir")?;
        fsutil::move_entry(&entry.path(), &previous_dir)?;
    }
    fsutil::retry_remove_dir(&scratch, prompt)?;

    info!("previous version restored in {}", game_dir.display());
    Ok(true)
}
