//! Game installation discovery.
//!
//! An installation is never cached as a long-lived object; it is
//! re-derived from the filesystem every time the orchestrator needs it,
//! since updates, restores and the game itself all mutate the directory.

use std::path::{Path, PathBuf};

/// Sidecar directory holding the displaced previous installation.
pub const PREVIOUS_VERSION_DIR: &str = "previous_version";

/// Recognized executable names, checked in order.
pub const CONSOLE_EXE: &str = "cataclysm.exe";
pub const TILES_EXE: &str = "cataclysm-tiles.exe";

/// Graphics variant implied by which executable is present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Console,
    Tiles,
}

impl Variant {
    pub fn label(&self) -> &'static str {
        match self {
            Variant::Console => "console",
            Variant::Tiles => "tiles",
        }
    }
}

/// A looked-up game installation directory.
#[derive(Debug, Clone)]
pub struct GameDir {
    pub path: PathBuf,
    /// Present when a recognized executable was found.
    pub executable: Option<(PathBuf, Variant)>,
}

impl GameDir {
    /// Inspect `path` for a game installation.
    pub fn discover(path: &Path) -> Self {
        let console = path.join(CONSOLE_EXE);
        let tiles = path.join(TILES_EXE);
        let executable = if console.is_file() {
            Some((console, Variant::Console))
        } else if tiles.is_file() {
            Some((tiles, Variant::Tiles))
        } else {
            None
        };
        GameDir {
            path: path.to_path_buf(),
            executable,
        }
    }

    pub fn exe_path(&self) -> Option<&Path> {
        self.executable.as_ref().map(|(path, _)| path.as_path())
    }

    pub fn previous_version_dir(&self) -> PathBuf {
        self.path.join(PREVIOUS_VERSION_DIR)
    }

    pub fn has_previous_version(&self) -> bool {
        self.previous_version_dir().is_dir()
    }

    pub fn save_dir(&self) -> PathBuf {
        self.path.join("save")
    }

    pub fn tilesets_dir(&self) -> PathBuf {
        self.path.join("gfx")
    }

    pub fn soundpacks_dir(&self) -> PathBuf {
        self.path.join("data").join("sound")
    }

    pub fn mods_dir(&self) -> PathBuf {
        self.path.join("data").join("mods")
    }

    pub fn fonts_dir(&self) -> PathBuf {
        self.path.join("data").join("font")
    }
}
