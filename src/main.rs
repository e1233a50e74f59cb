//! Catapult - Cataclysm: DDA launcher and build updater
//!
//! Hurls fresh experimental builds into your game directory without
//! flattening your saves, mods or tilesets.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use catapult::backup;
use catapult::catalog::{self, Build, Graphics, Platform};
use catapult::config::{ConfigError, LauncherDb};
use catapult::download::HttpTransport;
use catapult::fingerprint::{fingerprint_exe, FingerprintOutcome};
use catapult::fsutil::{Prompter, RetryChoice};
use catapult::game_dir::GameDir;
use catapult::progress::{self, CancelFlag, ProgressEvent, ProgressFn, UpdateStage};
use catapult::update::{UpdateOutcome, Updater};

#[derive(Parser)]
#[command(name = "catapult")]
#[command(version)]
#[command(about = "Cataclysm: DDA launcher - updates experimental builds without losing your stuff")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available experimental builds
    Builds {
        /// Use the console (curses) build listing
        #[arg(long)]
        console: bool,

        /// Use the 32-bit build listing
        #[arg(long)]
        x86: bool,

        /// How many builds to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Install or update the game in a directory
    Install {
        /// Game directory (remembered for next time)
        game_dir: Option<PathBuf>,

        /// Build number to install (defaults to the newest)
        #[arg(short, long)]
        build: Option<String>,

        /// Leave the save directory in place during the update
        #[arg(long)]
        prevent_save_move: bool,

        /// Keep a copy of the downloaded archive in this directory
        #[arg(long, value_name = "DIR")]
        keep_archive: Option<PathBuf>,

        /// Install the console (curses) build
        #[arg(long)]
        console: bool,

        /// Install the 32-bit build
        #[arg(long)]
        x86: bool,
    },

    /// Swap the current build with the previous one
    Restore {
        /// Game directory (defaults to the remembered one)
        game_dir: Option<PathBuf>,
    },

    /// Identify the installed build
    Version {
        /// Game directory (defaults to the remembered one)
        game_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose)?;

    match cli.command {
        Commands::Builds {
            console,
            x86,
            limit,
            json,
        } => {
            let transport = HttpTransport::new()?;
            let builds = catalog::fetch_builds(
                transport.client(),
                graphics_flag(console),
                platform_flag(x86),
            )
            .await?;
            if json {
                let shown: Vec<_> = builds.iter().take(limit).collect();
                println!("{}", serde_json::to_string_pretty(&shown)?);
                return Ok(());
            }
            if builds.is_empty() {
                println!("No builds available.");
                return Ok(());
            }
            for build in builds.iter().take(limit) {
                let number = build.number.as_deref().unwrap_or("?");
                let date = build
                    .date
                    .map(|date| date.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{number:>8}  {date:<17}  {}", build.name);
            }
        }

        Commands::Install {
            game_dir,
            build,
            prevent_save_move,
            keep_archive,
            console,
            x86,
        } => {
            let db = LauncherDb::open()?;
            let game_dir = resolve_game_dir(&db, game_dir)?;

            let mut options = db.update_options()?;
            if prevent_save_move {
                options.prevent_save_move = true;
            }
            if let Some(dir) = keep_archive {
                options.keep_archive_copy = true;
                options.archive_directory = Some(dir);
            }

            let graphics = if console { Graphics::Console } else { db.graphics()? };
            let platform = if x86 { Platform::X86 } else { db.platform()? };
            if console {
                db.set_graphics(graphics)?;
            }
            if x86 {
                db.set_platform(platform)?;
            }

            let transport = HttpTransport::new()?;
            let builds = catalog::fetch_builds(transport.client(), graphics, platform).await?;
            let selected = select_build(&builds, build.as_deref())?;
            let newest = builds.first().and_then(|b| b.number.clone());
            println!(
                "Selected build {} ({})",
                selected.number.as_deref().unwrap_or("?"),
                selected.name
            );

            let updater = Updater::new(transport, Arc::new(StdinPrompter), render_progress());
            cancel_on_ctrl_c(updater.cancel_flag());

            let outcome = updater.run(&db, &game_dir, &selected, &options).await?;
            match outcome {
                UpdateOutcome::Completed { message } => {
                    println!("{message}");
                    match (selected.number.as_deref(), newest.as_deref()) {
                        (Some(installed), Some(newest)) if installed == newest => {
                            println!("The game is up to date.");
                        }
                        (_, Some(newest)) => {
                            println!("A newer build is available: {newest}.");
                        }
                        _ => {}
                    }
                }
                UpdateOutcome::Cancelled { message } => println!("{message}"),
                UpdateOutcome::Failed { message } => {
                    eprintln!("{message}");
                    std::process::exit(1);
                }
            }
        }

        Commands::Restore { game_dir } => {
            let db = LauncherDb::open()?;
            let game_dir = resolve_game_dir(&db, game_dir)?;
            let options = db.update_options()?;
            if backup::swap_with_previous(&game_dir, &options, &StdinPrompter)? {
                println!("Previous version restored.");
            } else {
                println!("No previous version to restore.");
            }
        }

        Commands::Version { game_dir } => {
            let db = LauncherDb::open()?;
            let game_dir = resolve_game_dir(&db, game_dir)?;
            let game = GameDir::discover(&game_dir);
            let Some(exe_path) = game.exe_path() else {
                bail!("No game executable found in {}", game_dir.display());
            };
            let outcome = fingerprint_exe(exe_path, &progress::sink(), &CancelFlag::new())?;
            let FingerprintOutcome::Done(fingerprint) = outcome else {
                unreachable!("fingerprinting without a cancel source cannot abort");
            };
            println!(
                "Version: {}",
                fingerprint.version.as_deref().unwrap_or("unknown")
            );
            println!("SHA-256: {}", fingerprint.sha256);
            if let Some(cached) = db.build_by_sha256(&fingerprint.sha256)? {
                match cached.released_on {
                    Some(date) => println!(
                        "Build:   {} (released {})",
                        cached.number,
                        date.format("%Y-%m-%d")
                    ),
                    None => println!("Build:   {}", cached.number),
                }
            }
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let Some(config_dir) = dirs::config_dir() else {
        return Err(ConfigError::NoConfigDir.into());
    };
    let log_dir = config_dir.join("catapult").join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log dir: {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(&log_dir, "catapult.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let default = if verbose { "catapult=debug" } else { "catapult=info" };
    let filter = EnvFilter::from_default_env().add_directive(default.parse()?);

    let stderr_layer = (verbose || std::env::var("RUST_LOG").is_ok())
        .then(|| tracing_subscriber::fmt::layer().with_writer(io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(stderr_layer)
        .init();
    Ok(Some(guard))
}

fn graphics_flag(console: bool) -> Graphics {
    if console {
        Graphics::Console
    } else {
        Graphics::Tiles
    }
}

fn platform_flag(x86: bool) -> Platform {
    if x86 {
        Platform::X86
    } else {
        Platform::X64
    }
}

fn resolve_game_dir(db: &LauncherDb, arg: Option<PathBuf>) -> Result<PathBuf> {
    match arg {
        Some(path) => {
            db.set_game_directory(&path)?;
            Ok(path)
        }
        None => db
            .existing_game_directory()?
            .ok_or_else(|| anyhow::anyhow!("No game directory configured; pass one")),
    }
}

fn select_build(builds: &[Build], wanted: Option<&str>) -> Result<Build> {
    match wanted {
        Some(number) => builds
            .iter()
            .find(|build| build.number.as_deref() == Some(number))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Build {number} is not in the listing")),
        None => builds
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("No builds available")),
    }
}

fn cancel_on_ctrl_c(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nCancelling after the current step...");
            cancel.cancel();
        }
    });
}

/// Interactive prompts on stderr/stdin.
struct StdinPrompter;

impl StdinPrompter {
    fn ask_yes_no(question: &str) -> bool {
        eprint!("{question} [y/N] ");
        let _ = io::stderr().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }
        matches!(answer.trim(), "y" | "Y" | "yes")
    }
}

impl Prompter for StdinPrompter {
    fn retry_fs_operation(&self, path: &Path, error: &io::Error) -> RetryChoice {
        eprintln!("Operation failed on {}: {error}", path.display());
        eprintln!("Close any program using that path (the game, a file explorer, an antivirus scan).");
        if Self::ask_yes_no("Retry?") {
            RetryChoice::Retry
        } else {
            RetryChoice::Cancel
        }
    }

    fn confirm_reupdate(&self) -> bool {
        Self::ask_yes_no("This build is already installed. Update anyway?")
    }
}

enum BarKind {
    Bytes,
    Count,
}

/// Render pipeline progress as indicatif bars, one per stage.
fn render_progress() -> ProgressFn {
    let state: Mutex<Option<(BarKind, ProgressBar)>> = Mutex::new(None);

    Arc::new(move |event| {
        let Ok(mut state) = state.lock() else {
            return;
        };

        match event {
            ProgressEvent::StageChanged { stage } => {
                if let Some((_, bar)) = state.take() {
                    bar.finish_and_clear();
                }
                if stage != UpdateStage::Idle {
                    println!("{}...", capitalize(stage.label()));
                }
            }
            ProgressEvent::DownloadProgress {
                bytes,
                total,
                bytes_per_sec: _,
            } => {
                let bar = bytes_bar(&mut *state, total.unwrap_or(0));
                bar.set_position(bytes);
            }
            ProgressEvent::BackupEntry { index, total, name }
            | ProgressEvent::ExtractEntry { index, total, name } => {
                let bar = count_bar(&mut *state, total as u64);
                bar.set_position(index as u64 + 1);
                bar.set_message(name);
            }
            ProgressEvent::FingerprintProgress { read, total } => {
                let bar = bytes_bar(&mut *state, total);
                bar.set_position(read);
            }
            ProgressEvent::CopyAnalysing { name, files, .. } => {
                if let Some((_, bar)) = state.as_ref() {
                    bar.set_message(format!("{name}: {files} files"));
                }
            }
            ProgressEvent::CopyProgress {
                name,
                copied,
                total,
                ..
            } => {
                let bar = bytes_bar(&mut *state, total);
                bar.set_position(copied);
                bar.set_message(name);
            }
            ProgressEvent::Status { message } => match state.as_ref() {
                Some((_, bar)) => bar.println(message),
                None => println!("{message}"),
            },
        }
    })
}

fn bytes_bar<'a>(
    state: &'a mut Option<(BarKind, ProgressBar)>,
    total: u64,
) -> &'a ProgressBar {
    if !matches!(state, Some((BarKind::Bytes, _))) {
        if let Some((_, bar)) = state.take() {
            bar.finish_and_clear();
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} {wide_msg}",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        *state = Some((BarKind::Bytes, bar));
    }
    let Some((_, bar)) = state.as_ref() else {
        unreachable!("bar installed above");
    };
    if bar.length() != Some(total) && total > 0 {
        bar.set_length(total);
    }
    bar
}

fn count_bar<'a>(
    state: &'a mut Option<(BarKind, ProgressBar)>,
    total: u64,
) -> &'a ProgressBar {
    if !matches!(state, Some((BarKind::Count, _))) {
        if let Some((_, bar)) = state.take() {
            bar.finish_and_clear();
        }
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        *state = Some((BarKind::Count, bar));
    }
    let Some((_, bar)) = state.as_ref() else {
        unreachable!("bar installed above");
    };
    bar
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
