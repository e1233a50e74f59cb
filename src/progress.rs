//! Progress reporting and cancellation primitives shared by every stage.
//!
//! The orchestrator and each long-running stage communicate with their
//! caller through a single callback taking [`ProgressEvent`] values.
//! Cancellation is a one-way switch checked between steps; a request made
//! mid-step takes effect before the next step starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Stage of the update/install state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    Idle,
    Downloading,
    Verifying,
    BackingUp,
    Extracting,
    Fingerprinting,
    Reconciling,
}

impl UpdateStage {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateStage::Idle => "idle",
            UpdateStage::Downloading => "downloading",
            UpdateStage::Verifying => "verifying",
            UpdateStage::BackingUp => "backing up",
            UpdateStage::Extracting => "extracting",
            UpdateStage::Fingerprinting => "fingerprinting",
            UpdateStage::Reconciling => "reconciling",
        }
    }
}

/// Progress event emitted by the pipeline.
///
/// Within a stage, counters never decrease.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// The orchestrator moved to a new stage.
    StageChanged { stage: UpdateStage },
    /// Download transfer progress. `total` is unknown until the server
    /// reports a content length.
    DownloadProgress {
        bytes: u64,
        total: Option<u64>,
        bytes_per_sec: f64,
    },
    /// One installation entry moved into the backup sidecar.
    BackupEntry {
        index: usize,
        total: usize,
        name: String,
    },
    /// One archive member extracted.
    ExtractEntry {
        index: usize,
        total: usize,
        name: String,
    },
    /// Executable fingerprinting progress in bytes.
    FingerprintProgress { read: u64, total: u64 },
    /// Tree-copy analysis phase discovered more content.
    CopyAnalysing {
        name: String,
        files: u64,
        bytes: u64,
    },
    /// Tree-copy transfer progress with a rolling rate estimate.
    CopyProgress {
        name: String,
        copied: u64,
        total: u64,
        bytes_per_sec: Option<f64>,
    },
    /// Human-readable status line ("Restoring custom tilesets", ...).
    Status { message: String },
}

/// Shared progress callback. Stages run on blocking workers, so the
/// callback must be cheap and thread-safe.
pub type ProgressFn = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

/// A no-op callback for callers that do not care about progress.
pub fn sink() -> ProgressFn {
    Arc::new(|_| {})
}

/// Cooperative cancellation switch for a single in-flight operation.
///
/// Cloning shares the underlying flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Takes effect before the next step of
    /// whichever stage is running.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Re-arm the flag for a fresh operation.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
