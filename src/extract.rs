//! Member-by-member archive extraction with progress and cancellation.
//!
//! The extractor walks the archive's directory listing and unpacks one
//! member per step, checking the cancellation flag before each. Cleanup
//! of a cancelled extraction (temp dir, partial destination) belongs to
//! the orchestrator's unwind path, not here.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use zip::ZipArchive;

use crate::progress::{CancelFlag, ProgressEvent, ProgressFn};

/// Result of an extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractOutcome {
    Completed,
    Aborted,
}

/// Extract every member of the archive at `archive_path` into `dest`.
///
/// The archive must already have passed verification; damaged members
/// here are hard errors, not statuses.
pub fn extract_archive(
    archive_path: &Path,
    dest: &Path,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<ExtractOutcome> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive: {}", archive_path.display()))?;
    let mut archive = ZipArchive::new(file)
        .with_context(|| format!("Failed to read archive: {}", archive_path.display()))?;
    let total = archive.len();
    debug!("extracting {total} members into {}", dest.display());

    for index in 0..total {
        if cancel.is_cancelled() {
            // The archive handle drops here; the orchestrator removes
            // the download dir and unwinds.
            return Ok(ExtractOutcome::Aborted);
        }

        let mut member = archive
            .by_index(index)
            .with_context(|| format!("Failed to read archive member {index}"))?;
        let name = member.name().to_string();
        progress(ProgressEvent::ExtractEntry {
            index,
            total,
            name: name.clone(),
        });

        let Some(relative) = member.enclosed_name() else {
            warn!("skipping archive member with unsafe path: {name}");
            continue;
        };
        let out_path = dest.join(relative);

        if member.is_dir() {
            fs::create_dir_all(&out_path)
                .with_context(|| format!("Failed to create directory: {}", out_path.display()))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            if !parent.is_dir() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }
        let mut out_file = File::create(&out_path)
            .with_context(|| format!("Failed to create: {}", out_path.display()))?;
        io::copy(&mut member, &mut out_file)
            .with_context(|| format!("Failed to extract: {name}"))?;

        #[cfg(unix)]
        if let Some(mode) = member.unix_mode() {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&out_path, Permissions::from_mode(mode))
                .with_context(|| format!("Failed to set permissions: {}", out_path.display()))?;
        }
    }

    Ok(ExtractOutcome::Completed)
}
