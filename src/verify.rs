//! Integrity verification for downloaded build archives.
//!
//! A build archive is trusted for extraction only after every member has
//! been read back against its stored checksum. Verification runs on a
//! blocking worker so the orchestrator can await it without stalling.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};
use zip::result::ZipError;
use zip::ZipArchive;

/// Outcome of verifying a downloaded archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStatus {
    /// The archive opens and every member's checksum matches.
    Valid,
    /// The container parsed but a member is damaged, or the archive
    /// directory itself is inconsistent.
    Corrupt,
    /// Not a valid archive container at all: truncated or non-archive
    /// download.
    Incomplete,
}

impl ArchiveStatus {
    /// User-facing message for a failed verification.
    pub fn failure_message(&self) -> Option<&'static str> {
        match self {
            ArchiveStatus::Valid => None,
            ArchiveStatus::Corrupt => Some("Downloaded archive is invalid"),
            ArchiveStatus::Incomplete => Some("Could not download game"),
        }
    }
}

/// Verify the archive at `path`.
///
/// Only I/O errors on the file itself (permissions, disappearing file)
/// are returned as `Err`; damaged content is a status, not an error.
pub fn verify_archive(path: &Path) -> Result<ArchiveStatus> {
    let file =
        File::open(path).with_context(|| format!("Failed to open archive: {}", path.display()))?;

    let mut archive = match ZipArchive::new(file) {
        Ok(archive) => archive,
        Err(ZipError::Io(error)) => {
            return Err(error)
                .with_context(|| format!("Failed to read archive: {}", path.display()));
        }
        Err(error) => {
            debug!("{} is not a readable archive: {error}", path.display());
            return Ok(ArchiveStatus::Incomplete);
        }
    };

    let mut sink = [0u8; 64 * 1024];
    for index in 0..archive.len() {
        let mut member = match archive.by_index(index) {
            Ok(member) => member,
            Err(error) => {
                warn!("archive member {index} unreadable: {error}");
                return Ok(ArchiveStatus::Corrupt);
            }
        };
        // Reading a member to EOF checks its CRC against the directory.
        loop {
            match member.read(&mut sink) {
                Ok(0) => break,
                Ok(_) => {}
                Err(error) if error.kind() == io::ErrorKind::InvalidData => {
                    warn!("archive member '{}' failed checksum: {error}", member.name());
                    return Ok(ArchiveStatus::Corrupt);
                }
                Err(error) => {
                    warn!("archive member '{}' unreadable: {error}", member.name());
                    return Ok(ArchiveStatus::Corrupt);
                }
            }
        }
    }

    Ok(ArchiveStatus::Valid)
}

/// Run [`verify_archive`] on a blocking worker.
pub async fn verify_archive_task(path: &Path) -> Result<ArchiveStatus> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || verify_archive(&path))
        .await
        .context("Archive verification worker panicked")?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Seek, SeekFrom, Write};
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut writer = ZipWriter::new(file);
        for (name, data) in members {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn well_formed_archive_is_valid() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.zip");
        write_zip(&path, &[("game/readme.txt", b"hello"), ("game/data.bin", &[7u8; 4096])]);
        assert_eq!(verify_archive(&path).unwrap(), ArchiveStatus::Valid);
    }

    #[test]
    fn zero_byte_file_is_incomplete() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty.zip");
        fs::write(&path, b"").unwrap();
        assert_eq!(verify_archive(&path).unwrap(), ArchiveStatus::Incomplete);
    }

    #[test]
    fn non_archive_download_is_incomplete() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("error_page.zip");
        fs::write(&path, b"<html>503 Service Unavailable</html>").unwrap();
        assert_eq!(verify_archive(&path).unwrap(), ArchiveStatus::Incomplete);
    }

    #[test]
    fn tampered_member_is_corrupt() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("tampered.zip");
        let payload = vec![0x5au8; 8192];
        let file = File::create(&path).unwrap();
        let mut writer = ZipWriter::new(file);
        let stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        writer.start_file("game/data.bin", stored).unwrap();
        writer.write_all(&payload).unwrap();
        writer.finish().unwrap();

        // Flip bytes inside the stored member data, leaving the central
        // directory (and its recorded CRC) intact.
        let mut file = fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.seek(SeekFrom::Start(200)).unwrap();
        file.write_all(&[0xa5; 64]).unwrap();
        drop(file);

        assert_eq!(verify_archive(&path).unwrap(), ArchiveStatus::Corrupt);
    }

    #[test]
    fn distinct_messages_for_each_failure() {
        assert!(ArchiveStatus::Valid.failure_message().is_none());
        let corrupt = ArchiveStatus::Corrupt.failure_message().unwrap();
        let incomplete = ArchiveStatus::Incomplete.failure_message().unwrap();
        assert_ne!(corrupt, incomplete);
    }

    #[tokio::test]
    async fn worker_wrapper_matches_sync_result() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("build.zip");
        write_zip(&path, &[("a.txt", b"abc")]);
        assert_eq!(
            verify_archive_task(&path).await.unwrap(),
            ArchiveStatus::Valid
        );
    }
}
