//! Cancellable, progress-reporting recursive directory copy.
//!
//! Two phases: an analysis pass walks the source breadth-first and
//! records every entry with running file/byte totals, then a copy pass
//! replays the recorded entries, streaming file contents in fixed-size
//! chunks with a rolling transfer-rate estimate. Cancellation is checked
//! between entries and between chunks; an abort leaves the partial
//! destination for the caller to clean up.
//!
//! This module knows nothing about game semantics. Backup, restore and
//! asset reconciliation all reuse it.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use filetime::FileTime;
use tracing::debug;

use crate::progress::{CancelFlag, ProgressEvent, ProgressFn};
use crate::READ_BUFFER_SIZE;

/// How many chunks between rolling transfer-rate samples.
const RATE_SAMPLE_CHUNKS: u64 = 10;

/// Result of a tree copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Completed,
    Aborted,
}

/// Totals accumulated by the analysis phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TreeStats {
    pub files: u64,
    pub bytes: u64,
}

#[derive(Debug)]
struct TreeEntry {
    rel: PathBuf,
    is_dir: bool,
}

/// Walk `src` breadth-first by directory, recording entries in discovery
/// order and accumulating totals. Reports incremental counts through
/// `progress` and honors `cancel` between entries.
fn analyse_tree(
    src: &Path,
    name: &str,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<Option<(Vec<TreeEntry>, TreeStats)>> {
    let mut entries = Vec::new();
    let mut stats = TreeStats::default();
    let mut next_scans: VecDeque<PathBuf> = VecDeque::new();
    next_scans.push_back(src.to_path_buf());

    while let Some(dir) = next_scans.pop_front() {
        let read_dir = fs::read_dir(&dir)
            .with_context(|| format!("Failed to scan directory: {}", dir.display()))?;
        for entry in read_dir {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let entry = entry.with_context(|| format!("Failed to scan: {}", dir.display()))?;
            let path = entry.path();
            let file_type = entry
                .file_type()
                .with_context(|| format!("Failed to stat: {}", path.display()))?;
            let rel = path
                .strip_prefix(src)
                .expect("scanned entry is under the scan root")
                .to_path_buf();

            if file_type.is_dir() {
                next_scans.push_back(path);
                entries.push(TreeEntry { rel, is_dir: true });
            } else {
                let size = entry
                    .metadata()
                    .with_context(|| format!("Failed to stat: {}", path.display()))?
                    .len();
                stats.files += 1;
                stats.bytes += size;
                entries.push(TreeEntry { rel, is_dir: false });
                progress(ProgressEvent::CopyAnalysing {
                    name: name.to_string(),
                    files: stats.files,
                    bytes: stats.bytes,
                });
            }
        }
    }

    Ok(Some((entries, stats)))
}

/// Copy the tree at `src` to the not-yet-existing `dst`.
///
/// `name` is a human-readable label carried in progress events. Fails
/// fast when `src` is not a directory or `dst` already exists. On
/// cancellation the open file handles are closed and `Aborted` is
/// returned; any partially written destination is the caller's to
/// remove.
pub fn copy_tree(
    src: &Path,
    dst: &Path,
    name: &str,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<CopyOutcome> {
    if !src.is_dir() {
        bail!("Source path '{}' is not a directory", src.display());
    }
    if dst.exists() {
        bail!("Destination path '{}' already exists", dst.display());
    }

    let Some((entries, stats)) = analyse_tree(src, name, progress, cancel)? else {
        return Ok(CopyOutcome::Aborted);
    };
    debug!(
        "copying {}: {} files, {} bytes -> {}",
        src.display(),
        stats.files,
        stats.bytes,
        dst.display()
    );

    fs::create_dir_all(dst)
        .with_context(|| format!("Failed to create destination: {}", dst.display()))?;

    let mut copied: u64 = 0;
    let mut chunk_count: u64 = 0;
    let mut last_sample_bytes: u64 = 0;
    let mut last_sample_time = Instant::now();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    for entry in &entries {
        if cancel.is_cancelled() {
            return Ok(CopyOutcome::Aborted);
        }

        let src_path = src.join(&entry.rel);
        let dst_path = dst.join(&entry.rel);

        if entry.is_dir {
            fs::create_dir_all(&dst_path)
                .with_context(|| format!("Failed to create directory: {}", dst_path.display()))?;
            continue;
        }

        if let Some(parent) = dst_path.parent() {
            if !parent.is_dir() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let mut source = File::open(&src_path)
            .with_context(|| format!("Failed to open: {}", src_path.display()))?;
        let mut destination = File::create(&dst_path)
            .with_context(|| format!("Failed to create: {}", dst_path.display()))?;

        loop {
            if cancel.is_cancelled() {
                return Ok(CopyOutcome::Aborted);
            }
            let read = source
                .read(&mut buf)
                .with_context(|| format!("Failed to read: {}", src_path.display()))?;
            if read == 0 {
                break;
            }
            destination
                .write_all(&buf[..read])
                .with_context(|| format!("Failed to write: {}", dst_path.display()))?;

            copied += read as u64;
            chunk_count += 1;

            let rate = if chunk_count % RATE_SAMPLE_CHUNKS == 0 {
                let elapsed = last_sample_time.elapsed().as_secs_f64().max(f64::EPSILON);
                let rate = (copied - last_sample_bytes) as f64 / elapsed;
                last_sample_bytes = copied;
                last_sample_time = Instant::now();
                Some(rate)
            } else {
                None
            };
            progress(ProgressEvent::CopyProgress {
                name: name.to_string(),
                copied,
                total: stats.bytes,
                bytes_per_sec: rate,
            });
        }

        drop(destination);
        replicate_metadata(&src_path, &dst_path)?;
    }

    Ok(CopyOutcome::Completed)
}

/// Carry timestamps and permissions from `src` over to `dst`.
fn replicate_metadata(src: &Path, dst: &Path) -> Result<()> {
    let metadata =
        fs::metadata(src).with_context(|| format!("Failed to stat: {}", src.display()))?;
    fs::set_permissions(dst, metadata.permissions())
        .with_context(|| format!("Failed to set permissions: {}", dst.display()))?;
    let atime = FileTime::from_last_access_time(&metadata);
    let mtime = FileTime::from_last_modification_time(&metadata);
    filetime::set_file_times(dst, atime, mtime)
        .with_context(|| format!("Failed to set timestamps: {}", dst.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::sink;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn build_source(root: &Path) -> TreeStats {
        fs::create_dir_all(root.join("sub/deeper")).unwrap();
        fs::create_dir_all(root.join("empty")).unwrap();
        fs::write(root.join("top.txt"), vec![1u8; 20_000]).unwrap();
        fs::write(root.join("sub/mid.bin"), vec![2u8; 5]).unwrap();
        fs::write(root.join("sub/deeper/leaf.dat"), vec![3u8; 40_000]).unwrap();
        TreeStats {
            files: 3,
            bytes: 20_000 + 5 + 40_000,
        }
    }

    fn on_disk_stats(root: &Path) -> TreeStats {
        let mut stats = TreeStats::default();
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                stats.files += 1;
                stats.bytes += entry.metadata().unwrap().len();
            }
        }
        stats
    }

    #[test]
    fn analysis_totals_match_transferred_bytes() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let expected = build_source(&src);
        let dst = temp.path().join("dst");

        let analysed = Arc::new(Mutex::new(TreeStats::default()));
        let analysed_cb = Arc::clone(&analysed);
        let progress: ProgressFn = Arc::new(move |event| {
            if let ProgressEvent::CopyAnalysing { files, bytes, .. } = event {
                let mut stats = analysed_cb.lock().unwrap();
                stats.files = files;
                stats.bytes = bytes;
            }
        });

        let outcome = copy_tree(&src, &dst, "fixture", &progress, &CancelFlag::new()).unwrap();
        assert_eq!(outcome, CopyOutcome::Completed);
        assert_eq!(*analysed.lock().unwrap(), expected);
        assert_eq!(on_disk_stats(&dst), expected);
        // Empty directories still get created.
        assert!(dst.join("empty").is_dir());
        assert!(dst.join("sub/deeper").is_dir());
    }

    #[test]
    fn empty_source_creates_destination() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir(&src).unwrap();
        let dst = temp.path().join("dst");

        let outcome = copy_tree(&src, &dst, "empty", &sink(), &CancelFlag::new()).unwrap();
        assert_eq!(outcome, CopyOutcome::Completed);
        assert!(dst.is_dir());
        assert_eq!(fs::read_dir(&dst).unwrap().count(), 0);
    }

    #[test]
    fn fails_fast_on_bad_endpoints() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("plain.txt");
        fs::write(&file, b"x").unwrap();
        let dst = temp.path().join("dst");

        assert!(copy_tree(&file, &dst, "t", &sink(), &CancelFlag::new()).is_err());

        let src = temp.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::create_dir(&dst).unwrap();
        assert!(copy_tree(&src, &dst, "t", &sink(), &CancelFlag::new()).is_err());
    }

    #[test]
    fn cancellation_mid_copy_reports_aborted() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        build_source(&src);
        let dst = temp.path().join("dst");

        let cancel = CancelFlag::new();
        let cancel_cb = cancel.clone();
        let chunks = Arc::new(AtomicU64::new(0));
        let chunks_cb = Arc::clone(&chunks);
        let progress: ProgressFn = Arc::new(move |event| {
            if let ProgressEvent::CopyProgress { .. } = event {
                if chunks_cb.fetch_add(1, Ordering::SeqCst) == 0 {
                    cancel_cb.cancel();
                }
            }
        });

        let outcome = copy_tree(&src, &dst, "fixture", &progress, &cancel).unwrap();
        assert_eq!(outcome, CopyOutcome::Aborted);
        // Partial destination is the caller's to clean; the copier only
        // guarantees it stopped before finishing.
        assert!(on_disk_stats(&dst).bytes < on_disk_stats(&src).bytes);
    }

    #[test]
    fn timestamps_are_replicated() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("stamp.txt"), b"stamp").unwrap();
        let old = FileTime::from_unix_time(1_000_000_000, 0);
        filetime::set_file_times(src.join("stamp.txt"), old, old).unwrap();
        let dst = temp.path().join("dst");

        copy_tree(&src, &dst, "stamp", &sink(), &CancelFlag::new()).unwrap();
        let metadata = fs::metadata(dst.join("stamp.txt")).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&metadata), old);
    }
}
