//! Build identification by reading the game executable.
//!
//! The executable embeds its version string (`0.F`, `0.F-3-g1234abc`, ...)
//! as a NUL-terminated token somewhere near the end of the file. We stream
//! the whole file once, feeding a SHA-256 digest and scanning a sliding
//! two-chunk window for the token. A token can straddle any chunk
//! boundary, and a partial match near an edge can precede the real one,
//! so the longest match seen across the whole stream wins.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::progress::{CancelFlag, ProgressEvent, ProgressFn};
use crate::READ_BUFFER_SIZE;

/// Version token: `0.F` or `1.A` style release letter, optionally with a
/// git-describe suffix, terminated by a NUL byte in the binary.
static VERSION_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?-u)(?P<version>[01]\.[A-F](-\d+-g[0-9a-f]+)?)\x00")
        .expect("version token pattern is valid")
});

/// Identity of an installed build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Extracted version token, `None` when the executable carries none.
    pub version: Option<String>,
    /// Lowercase hex SHA-256 of the whole file.
    pub sha256: String,
}

/// Result of a fingerprinting run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FingerprintOutcome {
    Done(Fingerprint),
    Aborted,
}

/// Stream the executable at `path`, reporting bytes read and honoring
/// cancellation between chunks.
pub fn fingerprint_exe(
    path: &Path,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<FingerprintOutcome> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open: {}", path.display()))?;
    let total = file
        .metadata()
        .with_context(|| format!("Failed to stat: {}", path.display()))?
        .len();

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut previous: Vec<u8> = Vec::new();
    let mut version = String::new();
    let mut read_total: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Ok(FingerprintOutcome::Aborted);
        }
        let read = file
            .read(&mut buf)
            .with_context(|| format!("Failed to read: {}", path.display()))?;
        if read == 0 {
            break;
        }
        let chunk = &buf[..read];

        // Scan the previous chunk's tail glued to this chunk, so a token
        // split across the boundary is still seen whole.
        let mut window = Vec::with_capacity(previous.len() + read);
        window.extend_from_slice(&previous);
        window.extend_from_slice(chunk);
        for capture in VERSION_TOKEN.captures_iter(&window) {
            let token = &capture["version"];
            if token.len() > version.len() {
                version = String::from_utf8_lossy(token).into_owned();
            }
        }

        hasher.update(chunk);
        read_total += read as u64;
        progress(ProgressEvent::FingerprintProgress {
            read: read_total,
            total,
        });
        previous = chunk.to_vec();
    }

    let sha256 = format!("{:x}", hasher.finalize());
    let version = if version.is_empty() {
        debug!("no version token found in {}", path.display());
        None
    } else {
        Some(version)
    };
    Ok(FingerprintOutcome::Done(Fingerprint { version, sha256 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::sink;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_exe(dir: &Path, contents: &[u8]) -> std::path::PathBuf {
        let path = dir.join("cataclysm-tiles.exe");
        fs::write(&path, contents).unwrap();
        path
    }

    fn expected_sha256(contents: &[u8]) -> String {
        format!("{:x}", Sha256::digest(contents))
    }

    fn run(path: &Path) -> Fingerprint {
        match fingerprint_exe(path, &sink(), &CancelFlag::new()).unwrap() {
            FingerprintOutcome::Done(fp) => fp,
            FingerprintOutcome::Aborted => panic!("unexpected abort"),
        }
    }

    #[test]
    fn finds_token_and_hash() {
        let temp = TempDir::new().unwrap();
        let mut contents = vec![0x90u8; 1000];
        contents.extend_from_slice(b"0.F-3-g1234abc\x00");
        contents.extend_from_slice(&[0x90u8; 500]);
        let path = write_exe(temp.path(), &contents);

        let fp = run(&path);
        assert_eq!(fp.version.as_deref(), Some("0.F-3-g1234abc"));
        assert_eq!(fp.sha256, expected_sha256(&contents));
    }

    #[test]
    fn token_survives_any_chunk_boundary_split() {
        let temp = TempDir::new().unwrap();
        let token = b"0.F-12-gdeadbeef\x00";
        // Slide the token across the first chunk boundary one byte at a
        // time, so every possible split point gets exercised.
        for offset in (READ_BUFFER_SIZE - token.len() - 1)..(READ_BUFFER_SIZE + 1) {
            let mut contents = vec![0u8; offset];
            contents.extend_from_slice(token);
            contents.resize(READ_BUFFER_SIZE * 2 + 77, 0u8);
            let path = write_exe(temp.path(), &contents);

            let fp = run(&path);
            assert_eq!(
                fp.version.as_deref(),
                Some("0.F-12-gdeadbeef"),
                "token lost at offset {offset}"
            );
            assert_eq!(fp.sha256, expected_sha256(&contents));
        }
    }

    #[test]
    fn longer_match_later_overrides_shorter_earlier() {
        let temp = TempDir::new().unwrap();
        let mut contents = Vec::new();
        // A spurious short token early in the stream...
        contents.extend_from_slice(b"0.E\x00");
        contents.resize(READ_BUFFER_SIZE + 13, 0u8);
        // ...must not beat the real, longer one found afterwards.
        contents.extend_from_slice(b"0.E-42-gcafe01\x00");
        let path = write_exe(temp.path(), &contents);

        let fp = run(&path);
        assert_eq!(fp.version.as_deref(), Some("0.E-42-gcafe01"));
    }

    #[test]
    fn shorter_match_later_does_not_override() {
        let temp = TempDir::new().unwrap();
        let mut contents = Vec::new();
        contents.extend_from_slice(b"0.F-8-g0123456\x00");
        contents.resize(READ_BUFFER_SIZE * 3, 0u8);
        contents.extend_from_slice(b"1.A\x00");
        let path = write_exe(temp.path(), &contents);

        let fp = run(&path);
        assert_eq!(fp.version.as_deref(), Some("0.F-8-g0123456"));
    }

    #[test]
    fn missing_token_still_yields_hash() {
        let temp = TempDir::new().unwrap();
        let contents = vec![0xffu8; 4096];
        let path = write_exe(temp.path(), &contents);

        let fp = run(&path);
        assert_eq!(fp.version, None);
        assert_eq!(fp.sha256, expected_sha256(&contents));
    }

    #[test]
    fn cancellation_between_chunks_aborts() {
        let temp = TempDir::new().unwrap();
        let contents = vec![0u8; READ_BUFFER_SIZE * 4];
        let path = write_exe(temp.path(), &contents);

        let cancel = CancelFlag::new();
        let cancel_cb = cancel.clone();
        let progress: ProgressFn = Arc::new(move |event| {
            if let ProgressEvent::FingerprintProgress { .. } = event {
                cancel_cb.cancel();
            }
        });
        let outcome = fingerprint_exe(&path, &progress, &cancel).unwrap();
        assert_eq!(outcome, FingerprintOutcome::Aborted);
    }
}
