//! Launcher settings and the local build cache.
//!
//! A small sqlite database under the user config dir holds two tables:
//! a `settings` key/value store (save preservation, archive copies,
//! selected graphics/platform) and a `builds` cache mapping executable
//! content hashes to known builds, so an installation can be identified
//! without re-downloading anything.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::catalog::{Graphics, Platform};

/// Settings that shape a single update/install operation.
///
/// Snapshotted from the store when the operation starts; the pipeline
/// never reads the database mid-flight.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    /// Leave the `save` subtree in place during backup/restore.
    pub prevent_save_move: bool,
    /// Keep a copy of the downloaded archive after extraction.
    pub keep_archive_copy: bool,
    /// Where archive copies go. Ignored unless it is a valid directory.
    pub archive_directory: Option<PathBuf>,
}

/// A build known to the local cache, keyed by executable hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedBuild {
    pub number: String,
    pub released_on: Option<DateTime<Utc>>,
}

/// Configuration errors surfaced before any operation starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Game directory not found: {0}")]
    GameDirNotFound(PathBuf),

    #[error("Cannot install game on a file")]
    GameDirIsFile,

    #[error("Could not determine config directory")]
    NoConfigDir,
}

/// Sqlite-backed launcher database.
pub struct LauncherDb {
    conn: Connection,
}

impl LauncherDb {
    /// Open or create the database at the default location.
    pub fn open() -> Result<Self> {
        let path = Self::default_path()?;
        Self::open_at(&path)
    }

    /// Open or create the database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open launcher database: {}", path.display()))?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or(ConfigError::NoConfigDir)?
            .join("catapult");
        Ok(config_dir.join("launcher.db"))
    }

    fn init_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS settings (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                CREATE TABLE IF NOT EXISTS builds (
                    sha256      TEXT PRIMARY KEY,
                    version     TEXT,
                    number      TEXT NOT NULL,
                    released_on TEXT
                );",
            )
            .context("Failed to initialize launcher database schema")?;
        Ok(())
    }

    pub fn get_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .with_context(|| format!("Failed to read setting '{key}'"))
    }

    pub fn set_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .with_context(|| format!("Failed to write setting '{key}'"))?;
        Ok(())
    }

    fn get_bool(&self, key: &str) -> Result<bool> {
        Ok(matches!(
            self.get_value(key)?.as_deref(),
            Some("true") | Some("1")
        ))
    }

    pub fn game_directory(&self) -> Result<Option<PathBuf>> {
        Ok(self.get_value("game_directory")?.map(PathBuf::from))
    }

    pub fn set_game_directory(&self, path: &Path) -> Result<()> {
        self.set_value("game_directory", &path.to_string_lossy())
    }

    /// The remembered game directory, verified to still exist on disk.
    pub fn existing_game_directory(&self) -> Result<Option<PathBuf>> {
        match self.game_directory()? {
            Some(path) if path.is_dir() => Ok(Some(path)),
            Some(path) => Err(ConfigError::GameDirNotFound(path).into()),
            None => Ok(None),
        }
    }

    pub fn graphics(&self) -> Result<Graphics> {
        Ok(match self.get_value("graphics")?.as_deref() {
            Some("Console") => Graphics::Console,
            _ => Graphics::Tiles,
        })
    }

    pub fn set_graphics(&self, graphics: Graphics) -> Result<()> {
        self.set_value("graphics", graphics.label())
    }

    pub fn platform(&self) -> Result<Platform> {
        Ok(match self.get_value("platform")?.as_deref() {
            Some("x86") => Platform::X86,
            _ => Platform::X64,
        })
    }

    pub fn set_platform(&self, platform: Platform) -> Result<()> {
        self.set_value("platform", platform.label())
    }

    /// Snapshot the settings an update operation needs.
    pub fn update_options(&self) -> Result<UpdateOptions> {
        Ok(UpdateOptions {
            prevent_save_move: self.get_bool("prevent_save_move")?,
            keep_archive_copy: self.get_bool("keep_archive_copy")?,
            archive_directory: self.get_value("archive_directory")?.map(PathBuf::from),
        })
    }

    /// Register a (version, hash, build) triple seen after an update, so
    /// the next launch can identify the installation offline.
    pub fn register_build(
        &self,
        sha256: &str,
        version: Option<&str>,
        number: &str,
        released_on: Option<DateTime<Utc>>,
    ) -> Result<()> {
        info!("registering build {number} for hash {sha256}");
        self.conn
            .execute(
                "INSERT INTO builds (sha256, version, number, released_on)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(sha256) DO UPDATE SET
                     version = excluded.version,
                     number = excluded.number,
                     released_on = excluded.released_on",
                params![sha256, version, number, released_on.map(|d| d.to_rfc3339())],
            )
            .context("Failed to register build")?;
        Ok(())
    }

    /// Look up a build by executable content hash.
    pub fn build_by_sha256(&self, sha256: &str) -> Result<Option<CachedBuild>> {
        self.conn
            .query_row(
                "SELECT number, released_on FROM builds WHERE sha256 = ?1",
                params![sha256],
                |row| {
                    let number: String = row.get(0)?;
                    let released_on: Option<String> = row.get(1)?;
                    Ok((number, released_on))
                },
            )
            .optional()
            .context("Failed to look up build by hash")
            .map(|row| {
                row.map(|(number, released_on)| CachedBuild {
                    number,
                    released_on: released_on
                        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                        .map(|date| date.with_timezone(&Utc)),
                })
            })
    }
}
