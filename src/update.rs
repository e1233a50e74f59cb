//! The update/install orchestrator.
//!
//! One operation runs at a time and walks a fixed stage order: download,
//! verify, back up, extract, fingerprint, reconcile, then back to idle.
//! Cancellation is reachable from every stage and is an outcome, never an
//! error. Once the backup stage has run, failure and cancellation share a
//! single unwind: displace whatever the failed stage left in the game
//! directory, bring the backup home, then stash the displaced content in
//! the sidecar so nothing is ever lost.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::backup::{self, BackupOutcome};
use crate::catalog::Build;
use crate::config::{ConfigError, LauncherDb, UpdateOptions};
use crate::download::{FetchOutcome, Transport};
use crate::extract::{self, ExtractOutcome};
use crate::fingerprint::{fingerprint_exe, Fingerprint, FingerprintOutcome};
use crate::fsutil::{self, Prompter};
use crate::game_dir::{GameDir, PREVIOUS_VERSION_DIR};
use crate::progress::{self, CancelFlag, ProgressEvent, ProgressFn, UpdateStage};
use crate::reconcile::{self, ReconcileOutcome};
use crate::verify;

/// Terminal result of an update/install operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Completed { message: String },
    Cancelled { message: String },
    Failed { message: String },
}

/// Runs update/install operations against a game directory.
pub struct Updater<T: Transport> {
    transport: T,
    prompt: Arc<dyn Prompter>,
    progress: ProgressFn,
    cancel: CancelFlag,
    in_progress: AtomicBool,
}

impl<T: Transport> Updater<T> {
    pub fn new(transport: T, prompt: Arc<dyn Prompter>, progress: ProgressFn) -> Self {
        Self {
            transport,
            prompt,
            progress,
            cancel: CancelFlag::new(),
            in_progress: AtomicBool::new(false),
        }
    }

    /// Shared flag a UI can use to cancel the running operation.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    fn stage(&self, stage: UpdateStage) {
        info!("stage: {}", stage.label());
        (self.progress)(ProgressEvent::StageChanged { stage });
    }

    /// Run one full operation: install when `game_path` has no
    /// executable, update otherwise.
    pub async fn run(
        &self,
        db: &LauncherDb,
        game_path: &Path,
        build: &Build,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            bail!("another operation is already in progress");
        }
        self.cancel.reset();

        let result = self.run_inner(db, game_path, build, options).await;

        self.stage(UpdateStage::Idle);
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    async fn run_inner(
        &self,
        db: &LauncherDb,
        game_path: &Path,
        build: &Build,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome> {
        if game_path.is_file() {
            return Err(ConfigError::GameDirIsFile.into());
        }
        fs::create_dir_all(game_path)
            .with_context(|| format!("Failed to create game directory: {}", game_path.display()))?;

        let game = GameDir::discover(game_path);
        let fresh_install = game.exe_path().is_none();
        let operation = if fresh_install { "Installation" } else { "Update" };
        info!(
            "{} of build {} into {}",
            operation.to_lowercase(),
            build.number.as_deref().unwrap_or(&build.name),
            game_path.display()
        );

        if !fresh_install && self.already_on_build(db, &game, build).await? {
            if !self.prompt.confirm_reupdate() {
                info!("build already installed, user declined re-update");
                return Ok(cancelled(operation));
            }
        }

        // Download.
        self.stage(UpdateStage::Downloading);
        let download_dir = fsutil::scratch_dir("download")?;
        let archive_path = download_dir.join(&build.name);
        match self
            .transport
            .fetch(&build.url, &archive_path, &self.progress, &self.cancel)
            .await
        {
            Ok(FetchOutcome::Completed) => {}
            Ok(FetchOutcome::Aborted) => {
                remove_download_dir(&download_dir);
                return Ok(cancelled(operation));
            }
            Err(error) => {
                warn!("download failed: {error:#}");
                remove_download_dir(&download_dir);
                return Ok(UpdateOutcome::Failed {
                    message: "Could not download game".into(),
                });
            }
        }

        // Verify before anything touches the installation.
        self.stage(UpdateStage::Verifying);
        let status = verify::verify_archive_task(&archive_path).await?;
        if let Some(message) = status.failure_message() {
            remove_download_dir(&download_dir);
            return Ok(UpdateOutcome::Failed {
                message: message.into(),
            });
        }
        if self.cancel.is_cancelled() {
            remove_download_dir(&download_dir);
            return Ok(cancelled(operation));
        }

        // Back up. A failure here gets no unwind: entries already moved
        // stay in the sidecar for the user to inspect.
        self.stage(UpdateStage::BackingUp);
        let backup_result = {
            let game_path = game_path.to_path_buf();
            let options = options.clone();
            let prompt = Arc::clone(&self.prompt);
            let progress = Arc::clone(&self.progress);
            let cancel = self.cancel.clone();
            run_blocking(move || {
                backup::backup_current(&game_path, &options, prompt.as_ref(), &progress, &cancel)
            })
            .await
        };
        match backup_result {
            Ok(BackupOutcome::Completed) => {}
            Ok(BackupOutcome::Aborted) => {
                backup::restore_backup(game_path, options, self.prompt.as_ref())?;
                remove_download_dir(&download_dir);
                return Ok(cancelled(operation));
            }
            Err(error) => {
                warn!("backup failed: {error:#}");
                remove_download_dir(&download_dir);
                return Ok(UpdateOutcome::Failed {
                    message: format!("{error:#}"),
                });
            }
        }

        // Extract into the now mostly-empty game directory.
        self.stage(UpdateStage::Extracting);
        let extract_result = {
            let archive_path = archive_path.clone();
            let dest = game_path.to_path_buf();
            let progress = Arc::clone(&self.progress);
            let cancel = self.cancel.clone();
            run_blocking(move || extract::extract_archive(&archive_path, &dest, &progress, &cancel))
                .await
        };
        match extract_result {
            Ok(ExtractOutcome::Completed) => {}
            Ok(ExtractOutcome::Aborted) => {
                remove_download_dir(&download_dir);
                self.unwind(game_path, options)?;
                return Ok(cancelled(operation));
            }
            Err(error) => {
                warn!("extraction failed: {error:#}");
                remove_download_dir(&download_dir);
                self.unwind(game_path, options)?;
                return Ok(UpdateOutcome::Failed {
                    message: format!("{error:#}"),
                });
            }
        }

        self.relocate_archive(&archive_path, options);
        remove_download_dir(&download_dir);

        // Identify what was just extracted.
        self.stage(UpdateStage::Fingerprinting);
        let game = GameDir::discover(game_path);
        let Some(exe_path) = game.exe_path() else {
            return Ok(UpdateOutcome::Failed {
                message: format!(
                    "No game executable found after extraction; the {PREVIOUS_VERSION_DIR} \
                     directory still holds the replaced installation"
                ),
            });
        };
        let fingerprint_result = {
            let exe_path = exe_path.to_path_buf();
            let progress = Arc::clone(&self.progress);
            let cancel = self.cancel.clone();
            run_blocking(move || fingerprint_exe(&exe_path, &progress, &cancel)).await?
        };
        let fingerprint = match fingerprint_result {
            FingerprintOutcome::Done(fingerprint) => fingerprint,
            FingerprintOutcome::Aborted => {
                self.unwind(game_path, options)?;
                return Ok(cancelled(operation));
            }
        };
        if let Some(number) = build.number.as_deref() {
            db.register_build(
                &fingerprint.sha256,
                fingerprint.version.as_deref(),
                number,
                build.date,
            )?;
        }

        // Bring the user's content over from the sidecar.
        self.stage(UpdateStage::Reconciling);
        let reconcile_result = {
            let game = game.clone();
            let options = options.clone();
            let progress = Arc::clone(&self.progress);
            let cancel = self.cancel.clone();
            run_blocking(move || reconcile::reconcile_assets(&game, &options, &progress, &cancel))
                .await
        };
        match reconcile_result {
            Ok(ReconcileOutcome::Completed) => {}
            Ok(ReconcileOutcome::Aborted) => {
                self.unwind(game_path, options)?;
                return Ok(cancelled(operation));
            }
            Err(error) => {
                warn!("reconciliation failed: {error:#}");
                self.unwind(game_path, options)?;
                return Ok(UpdateOutcome::Failed {
                    message: format!("{error:#}"),
                });
            }
        }

        Ok(UpdateOutcome::Completed {
            message: completion_message(operation, build, &fingerprint),
        })
    }

    /// Whether the installed executable already matches the selected
    /// build, judged by the local build cache.
    async fn already_on_build(&self, db: &LauncherDb, game: &GameDir, build: &Build) -> Result<bool> {
        let (Some(exe_path), Some(selected)) = (game.exe_path(), build.number.as_deref()) else {
            return Ok(false);
        };
        let exe_path = exe_path.to_path_buf();
        let outcome =
            run_blocking(move || fingerprint_exe(&exe_path, &progress::sink(), &CancelFlag::new()))
                .await?;
        let FingerprintOutcome::Done(fingerprint) = outcome else {
            return Ok(false);
        };
        Ok(db
            .build_by_sha256(&fingerprint.sha256)?
            .is_some_and(|cached| cached.number == selected))
    }

    /// Keep a copy of the downloaded archive when configured. Best
    /// effort: a failed copy never fails the operation.
    fn relocate_archive(&self, archive_path: &Path, options: &UpdateOptions) {
        if !options.keep_archive_copy {
            return;
        }
        let Some(archive_dir) = options.archive_directory.as_deref() else {
            return;
        };
        if !archive_dir.is_dir() {
            warn!(
                "archive directory is not a directory, not keeping a copy: {}",
                archive_dir.display()
            );
            return;
        }
        let Some(name) = archive_path.file_name() else {
            return;
        };
        if archive_dir.join(name).exists() {
            info!("archive copy already present, skipping");
            return;
        }
        match fsutil::move_entry(archive_path, archive_dir) {
            Ok(kept) => info!("kept archive copy at {}", kept.display()),
            Err(error) => warn!("failed to keep archive copy: {error}"),
        }
    }

    /// The single unwind path for failure and cancellation after backup:
    /// move aside whatever the failed stage produced, restore the backup,
    /// then fold the displaced content into the sidecar.
    fn unwind(&self, game_path: &Path, options: &UpdateOptions) -> Result<()> {
        info!("unwinding operation in {}", game_path.display());
        let scratch = backup::clean_game_dir(game_path, options)?;
        backup::restore_backup(game_path, options, self.prompt.as_ref())?;
        backup::restore_previous_content(game_path, scratch.as_deref())?;
        Ok(())
    }
}

/// Run one blocking stage on a worker, like the verifier does.
async fn run_blocking<T, F>(task: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("Stage worker panicked")?
}

fn cancelled(operation: &str) -> UpdateOutcome {
    UpdateOutcome::Cancelled {
        message: format!("{operation} cancelled"),
    }
}

fn completion_message(operation: &str, build: &Build, fingerprint: &Fingerprint) -> String {
    let version = fingerprint.version.as_deref().unwrap_or("unknown version");
    match build.number.as_deref() {
        Some(number) => format!("{operation} complete: build {number} ({version})"),
        None => format!("{operation} complete: {version}"),
    }
}

fn remove_download_dir(download_dir: &Path) {
    if let Err(error) = fsutil::force_remove_dir_all(download_dir) {
        warn!(
            "failed to remove download dir {}: {error}",
            download_dir.display()
        );
    }
}
