//! Archive download over an abstract transport.
//!
//! The orchestrator only needs "fetch this URL into this file, report
//! progress, honor cancellation". [`Transport`] captures exactly that,
//! so tests can swap the network for a local file copy.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::progress::{CancelFlag, ProgressEvent, ProgressFn};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Result of a fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Completed,
    Aborted,
}

/// Something that can materialize a URL as a local file.
pub trait Transport: Send + Sync {
    fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressFn,
        cancel: &CancelFlag,
    ) -> impl std::future::Future<Output = Result<FetchOutcome>> + Send;
}

/// Streaming HTTP transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressFn,
        cancel: &CancelFlag,
    ) -> Result<FetchOutcome> {
        info!("downloading {url} -> {}", dest.display());
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch: {url}"))?
            .error_for_status()
            .with_context(|| format!("Download request failed: {url}"))?;
        let total = response.content_length();

        let mut file = File::create(dest)
            .await
            .with_context(|| format!("Failed to create: {}", dest.display()))?;
        let mut stream = response.bytes_stream();
        let mut bytes: u64 = 0;
        let started = Instant::now();

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                debug!("download cancelled after {bytes} bytes");
                return Ok(FetchOutcome::Aborted);
            }
            let chunk = chunk.context("Failed to read download stream")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write: {}", dest.display()))?;
            bytes += chunk.len() as u64;

            let elapsed = started.elapsed().as_secs_f64();
            let bytes_per_sec = if elapsed > 0.0 {
                bytes as f64 / elapsed
            } else {
                0.0
            };
            progress(ProgressEvent::DownloadProgress {
                bytes,
                total,
                bytes_per_sec,
            });
        }
        file.flush()
            .await
            .with_context(|| format!("Failed to flush: {}", dest.display()))?;

        Ok(FetchOutcome::Completed)
    }
}

/// Transport that copies a local file, for exercising the pipeline
/// without a network.
pub struct FileTransport {
    source: PathBuf,
}

impl FileTransport {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl Transport for FileTransport {
    async fn fetch(
        &self,
        _url: &str,
        dest: &Path,
        progress: &ProgressFn,
        cancel: &CancelFlag,
    ) -> Result<FetchOutcome> {
        if cancel.is_cancelled() {
            return Ok(FetchOutcome::Aborted);
        }
        let bytes = tokio::fs::copy(&self.source, dest)
            .await
            .with_context(|| format!("Failed to copy: {}", self.source.display()))?;
        progress(ProgressEvent::DownloadProgress {
            bytes,
            total: Some(bytes),
            bytes_per_sec: 0.0,
        });
        Ok(FetchOutcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::sink;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn file_transport_copies_and_reports() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("archive.zip");
        std::fs::write(&source, b"payload").unwrap();
        let dest = temp.path().join("download.zip");

        let seen = Arc::new(AtomicU64::new(0));
        let seen_cb = seen.clone();
        let progress: ProgressFn = Arc::new(move |event| {
            if let ProgressEvent::DownloadProgress { bytes, .. } = event {
                seen_cb.store(bytes, Ordering::SeqCst);
            }
        });

        let transport = FileTransport::new(&source);
        let outcome = transport
            .fetch("file://archive", &dest, &progress, &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), b"payload");
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn file_transport_honors_cancellation() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("archive.zip");
        std::fs::write(&source, b"payload").unwrap();

        let cancel = CancelFlag::new();
        cancel.cancel();
        let transport = FileTransport::new(&source);
        let outcome = transport
            .fetch(
                "file://archive",
                &temp.path().join("download.zip"),
                &sink(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(outcome, FetchOutcome::Aborted);
    }
}
