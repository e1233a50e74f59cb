//! Carrying user content from the previous installation into the new one.
//!
//! After extraction the game directory holds pristine game content and
//! the `previous_version` sidecar holds everything the user had. Five
//! passes bring the user's things over: whole carried directories
//! (config, saves, ...), then custom tilesets, soundpacks, mods and
//! fonts. "Custom" means present in the previous installation under an
//! identifying name the new installation does not ship.
//!
//! Identity comes from descriptors, never from directory names: two
//! differently named directories containing the same tileset are the
//! same tileset.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::UpdateOptions;
use crate::copytree::{self, CopyOutcome};
use crate::fsutil;
use crate::game_dir::GameDir;
use crate::progress::{CancelFlag, ProgressEvent, ProgressFn};

/// Result of the reconciliation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Completed,
    Aborted,
}

/// Directories carried over wholesale, in pass order.
const CARRIED_DIRS: &[&str] = &[
    "config",
    "save",
    "templates",
    "memorial",
    "graveyard",
    "save_backups",
];

/// Read the `NAME` line of a launcher-style descriptor file
/// (`tileset.txt`, `soundpack.txt`). The value is whatever follows the
/// first space, trimmed, with commas stripped. A `.disabled` sibling is
/// consulted only when the primary file is absent.
pub fn asset_name(asset_dir: &Path, descriptor: &str) -> Option<String> {
    let primary = asset_dir.join(descriptor);
    let path = if primary.is_file() {
        primary
    } else {
        let disabled = asset_dir.join(format!("{descriptor}.disabled"));
        if !disabled.is_file() {
            return None;
        }
        disabled
    };

    let contents = fs::read_to_string(&path).ok()?;
    for line in contents.lines() {
        if line.starts_with("NAME") {
            let value = line.split_once(' ').map(|(_, rest)| rest).unwrap_or("");
            let value = value.trim().replace(',', "");
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Read the `ident` of a mod from its `modinfo.json`. The file holds
/// either a single object or a list of objects; the identity comes from
/// the entry whose `type` is `MOD_INFO`.
pub fn mod_ident(mod_dir: &Path) -> Option<String> {
    let primary = mod_dir.join("modinfo.json");
    let path = if primary.is_file() {
        primary
    } else {
        let disabled = mod_dir.join("modinfo.json.disabled");
        if !disabled.is_file() {
            return None;
        }
        disabled
    };

    let contents = fs::read_to_string(&path).ok()?;
    let value: Value = serde_json::from_str(&contents).ok()?;
    let objects: Vec<&Value> = match &value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    };
    objects
        .into_iter()
        .filter(|object| object.get("type").and_then(Value::as_str) == Some("MOD_INFO"))
        .find_map(|object| object.get("ident").and_then(Value::as_str))
        .map(str::to_string)
}

/// Map identifying names to asset directories, first directory wins when
/// two share a name. Directories without a readable identity are skipped.
fn index_assets<F>(container: &Path, identify: F) -> Result<BTreeMap<String, PathBuf>>
where
    F: Fn(&Path) -> Option<String>,
{
    let mut index = BTreeMap::new();
    if !container.is_dir() {
        return Ok(index);
    }
    let mut entries: Vec<PathBuf> = fs::read_dir(container)
        .with_context(|| format!("Failed to list: {}", container.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    entries.sort();

    for path in entries {
        match identify(&path) {
            Some(name) => {
                index.entry(name).or_insert(path);
            }
            None => debug!("no identity descriptor in {}", path.display()),
        }
    }
    Ok(index)
}

/// Copy previous assets whose identifying name the new installation does
/// not ship. Destinations that already exist are left alone.
fn restore_custom_assets<F>(
    previous_container: &Path,
    current_container: &Path,
    kind: &str,
    identify: F,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<ReconcileOutcome>
where
    F: Fn(&Path) -> Option<String> + Copy,
{
    let previous = index_assets(previous_container, identify)?;
    if previous.is_empty() {
        return Ok(ReconcileOutcome::Completed);
    }
    let official = index_assets(current_container, identify)?;

    for (name, source) in &previous {
        if cancel.is_cancelled() {
            return Ok(ReconcileOutcome::Aborted);
        }
        if official.contains_key(name) {
            continue;
        }
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target = current_container.join(&file_name);
        if target.exists() {
            debug!("{kind} target already present, skipping: {}", target.display());
            continue;
        }
        info!("restoring custom {kind} '{name}' from {}", source.display());
        progress(ProgressEvent::Status {
            message: format!("Restoring custom {kind}: {name}"),
        });
        fs::create_dir_all(current_container)
            .with_context(|| format!("Failed to create: {}", current_container.display()))?;
        if copy_tree(source, &target, &file_name, progress, cancel)? == CopyOutcome::Aborted {
            return Ok(ReconcileOutcome::Aborted);
        }
    }
    Ok(ReconcileOutcome::Completed)
}

fn copy_tree(
    source: &Path,
    target: &Path,
    name: &str,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<CopyOutcome> {
    match copytree::copy_tree(source, target, name, progress, cancel)? {
        CopyOutcome::Aborted => {
            // A half-copied asset is worse than a missing one.
            if let Err(error) = fsutil::force_remove_dir_all(target) {
                warn!("failed to clean partial copy {}: {error}", target.display());
            }
            Ok(CopyOutcome::Aborted)
        }
        outcome => Ok(outcome),
    }
}

/// Pass 1: move whole carried directories out of the sidecar.
fn restore_carried_dirs(
    game: &GameDir,
    options: &UpdateOptions,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<ReconcileOutcome> {
    let previous_dir = game.previous_version_dir();
    for name in CARRIED_DIRS {
        if cancel.is_cancelled() {
            return Ok(ReconcileOutcome::Aborted);
        }
        if *name == "save" && options.prevent_save_move {
            continue;
        }
        let source = previous_dir.join(name);
        if !source.is_dir() {
            continue;
        }
        let target = game.path.join(name);
        if target.exists() {
            debug!("carried dir already present, skipping: {}", target.display());
            continue;
        }
        progress(ProgressEvent::Status {
            message: format!("Restoring {name} directory"),
        });
        if copy_tree(&source, &target, name, progress, cancel)? == CopyOutcome::Aborted {
            return Ok(ReconcileOutcome::Aborted);
        }
        fsutil::force_remove_dir_all(&source)
            .with_context(|| format!("Failed to remove: {}", source.display()))?;
    }
    Ok(ReconcileOutcome::Completed)
}

/// Pass 4 extra: carry the default mod selection file when the new
/// installation does not ship one.
fn carry_default_mods_file(previous_mods: &Path, current_mods: &Path) -> Result<()> {
    let source = previous_mods.join("user-default-mods.json");
    let target = current_mods.join("user-default-mods.json");
    if source.is_file() && !target.exists() && current_mods.is_dir() {
        fs::copy(&source, &target)
            .with_context(|| format!("Failed to copy: {}", source.display()))?;
        debug!("carried user-default-mods.json");
    }
    Ok(())
}

/// Pass 5: fonts have no descriptors; a plain listing set-difference by
/// file name decides what gets carried.
fn restore_custom_fonts(
    previous_fonts: &Path,
    current_fonts: &Path,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<ReconcileOutcome> {
    if !previous_fonts.is_dir() {
        return Ok(ReconcileOutcome::Completed);
    }
    let mut names: Vec<_> = fs::read_dir(previous_fonts)
        .with_context(|| format!("Failed to list: {}", previous_fonts.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name())
        .collect();
    names.sort();

    for name in names {
        if cancel.is_cancelled() {
            return Ok(ReconcileOutcome::Aborted);
        }
        let target = current_fonts.join(&name);
        if target.exists() {
            continue;
        }
        let source = previous_fonts.join(&name);
        progress(ProgressEvent::Status {
            message: format!("Restoring custom font: {}", Path::new(&name).display()),
        });
        fs::create_dir_all(current_fonts)
            .with_context(|| format!("Failed to create: {}", current_fonts.display()))?;
        if source.is_dir() {
            let label = name.to_string_lossy().into_owned();
            if copy_tree(&source, &target, &label, progress, cancel)? == CopyOutcome::Aborted {
                return Ok(ReconcileOutcome::Aborted);
            }
        } else {
            fs::copy(&source, &target)
                .with_context(|| format!("Failed to copy: {}", source.display()))?;
        }
    }
    Ok(ReconcileOutcome::Completed)
}

/// Run all reconciliation passes against the sidecar.
///
/// Assets stay in the sidecar after the copy passes; only the carried
/// directories of pass 1 leave it. No-op when there is no sidecar.
pub fn reconcile_assets(
    game: &GameDir,
    options: &UpdateOptions,
    progress: &ProgressFn,
    cancel: &CancelFlag,
) -> Result<ReconcileOutcome> {
    let previous_dir = game.previous_version_dir();
    if !previous_dir.is_dir() {
        return Ok(ReconcileOutcome::Completed);
    }

    if restore_carried_dirs(game, options, progress, cancel)? == ReconcileOutcome::Aborted {
        return Ok(ReconcileOutcome::Aborted);
    }

    let outcome = restore_custom_assets(
        &previous_dir.join("gfx"),
        &game.tilesets_dir(),
        "tileset",
        |dir| asset_name(dir, "tileset.txt"),
        progress,
        cancel,
    )?;
    if outcome == ReconcileOutcome::Aborted {
        return Ok(ReconcileOutcome::Aborted);
    }

    let outcome = restore_custom_assets(
        &previous_dir.join("data").join("sound"),
        &game.soundpacks_dir(),
        "soundpack",
        |dir| asset_name(dir, "soundpack.txt"),
        progress,
        cancel,
    )?;
    if outcome == ReconcileOutcome::Aborted {
        return Ok(ReconcileOutcome::Aborted);
    }

    let previous_mods = previous_dir.join("data").join("mods");
    let outcome = restore_custom_assets(
        &previous_mods,
        &game.mods_dir(),
        "mod",
        mod_ident,
        progress,
        cancel,
    )?;
    if outcome == ReconcileOutcome::Aborted {
        return Ok(ReconcileOutcome::Aborted);
    }
    carry_default_mods_file(&previous_mods, &game.mods_dir())?;

    restore_custom_fonts(
        &previous_dir.join("data").join("font"),
        &game.fonts_dir(),
        progress,
        cancel,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::sink;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn write_descriptor(dir: &Path, file: &str, name: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(file), format!("#comment\nNAME {name}\nVIEW x\n")).unwrap();
    }

    fn game_with_sidecar() -> (TempDir, GameDir) {
        let temp = TempDir::new().unwrap();
        let game_path = temp.path().join("game");
        fs::create_dir_all(game_path.join("previous_version")).unwrap();
        let game = GameDir::discover(&game_path);
        (temp, game)
    }

    #[test]
    fn name_line_is_trimmed_and_stripped_of_commas() {
        let temp = TempDir::new().unwrap();
        write_descriptor(temp.path(), "tileset.txt", "  Chibi, Ultica  ");
        assert_eq!(
            asset_name(temp.path(), "tileset.txt").as_deref(),
            Some("Chibi Ultica")
        );
    }

    #[test]
    fn disabled_descriptor_is_a_fallback_only() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("tileset.txt.disabled"), "NAME fallback\n").unwrap();
        assert_eq!(
            asset_name(temp.path(), "tileset.txt").as_deref(),
            Some("fallback")
        );

        fs::write(temp.path().join("tileset.txt"), "NAME primary\n").unwrap();
        assert_eq!(
            asset_name(temp.path(), "tileset.txt").as_deref(),
            Some("primary")
        );
    }

    #[test]
    fn mod_ident_accepts_object_and_list_forms() {
        let temp = TempDir::new().unwrap();
        let object = temp.path().join("obj");
        fs::create_dir(&object).unwrap();
        fs::write(
            object.join("modinfo.json"),
            r#"{"type": "MOD_INFO", "ident": "my_mod"}"#,
        )
        .unwrap();
        assert_eq!(mod_ident(&object).as_deref(), Some("my_mod"));

        let list = temp.path().join("list");
        fs::create_dir(&list).unwrap();
        fs::write(
            list.join("modinfo.json"),
            r#"[{"type": "mod_definition"}, {"type": "MOD_INFO", "ident": "other_mod"}]"#,
        )
        .unwrap();
        assert_eq!(mod_ident(&list).as_deref(), Some("other_mod"));

        let broken = temp.path().join("broken");
        fs::create_dir(&broken).unwrap();
        fs::write(broken.join("modinfo.json"), "not json").unwrap();
        assert_eq!(mod_ident(&broken), None);
    }

    #[test]
    fn custom_is_decided_by_identifying_name_not_directory_name() {
        let (_temp, game) = game_with_sidecar();
        let previous_gfx = game.previous_version_dir().join("gfx");
        // Previous: A carries name "x", B carries name "y".
        write_descriptor(&previous_gfx.join("A"), "tileset.txt", "x");
        write_descriptor(&previous_gfx.join("B"), "tileset.txt", "y");
        // New installation ships "x" under a different directory name.
        write_descriptor(&game.tilesets_dir().join("C"), "tileset.txt", "x");

        let outcome = reconcile_assets(
            &game,
            &UpdateOptions::default(),
            &sink(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Completed);

        // Only B ("y") is custom; A duplicates an official tileset.
        assert!(game.tilesets_dir().join("B").join("tileset.txt").is_file());
        assert!(!game.tilesets_dir().join("A").exists());
    }

    #[test]
    fn carried_dirs_leave_the_sidecar_and_saves_can_stay() {
        let (_temp, game) = game_with_sidecar();
        let previous = game.previous_version_dir();
        fs::create_dir_all(previous.join("config")).unwrap();
        fs::write(previous.join("config").join("options.json"), b"{}").unwrap();
        fs::create_dir_all(previous.join("save")).unwrap();
        fs::write(previous.join("save").join("world.sav"), b"w").unwrap();

        let options = UpdateOptions {
            prevent_save_move: true,
            ..Default::default()
        };
        reconcile_assets(&game, &options, &sink(), &CancelFlag::new()).unwrap();

        assert!(game.path.join("config").join("options.json").is_file());
        assert!(!previous.join("config").exists());
        // Saves were preserved in place by the backup stage, so the
        // sidecar copy is ignored.
        assert!(!game.save_dir().exists());
        assert!(previous.join("save").join("world.sav").is_file());
    }

    #[test]
    fn custom_mods_and_default_selection_carry_over() {
        let (_temp, game) = game_with_sidecar();
        let previous_mods = game.previous_version_dir().join("data").join("mods");
        fs::create_dir_all(previous_mods.join("custom_mod")).unwrap();
        fs::write(
            previous_mods.join("custom_mod").join("modinfo.json"),
            r#"{"type": "MOD_INFO", "ident": "custom"}"#,
        )
        .unwrap();
        fs::write(previous_mods.join("user-default-mods.json"), b"[]").unwrap();

        fs::create_dir_all(game.mods_dir().join("shipped")).unwrap();
        fs::write(
            game.mods_dir().join("shipped").join("modinfo.json"),
            r#"{"type": "MOD_INFO", "ident": "dda"}"#,
        )
        .unwrap();

        reconcile_assets(
            &game,
            &UpdateOptions::default(),
            &sink(),
            &CancelFlag::new(),
        )
        .unwrap();

        assert!(game.mods_dir().join("custom_mod").join("modinfo.json").is_file());
        assert!(game.mods_dir().join("user-default-mods.json").is_file());
        // Copy passes never drain the sidecar.
        assert!(previous_mods.join("custom_mod").exists());
    }

    #[test]
    fn fonts_use_plain_listing_difference() {
        let (_temp, game) = game_with_sidecar();
        let previous_fonts = game.previous_version_dir().join("data").join("font");
        fs::create_dir_all(&previous_fonts).unwrap();
        fs::write(previous_fonts.join("custom.ttf"), b"font").unwrap();
        fs::write(previous_fonts.join("shipped.ttf"), b"old").unwrap();

        fs::create_dir_all(game.fonts_dir()).unwrap();
        fs::write(game.fonts_dir().join("shipped.ttf"), b"new").unwrap();

        reconcile_assets(
            &game,
            &UpdateOptions::default(),
            &sink(),
            &CancelFlag::new(),
        )
        .unwrap();

        assert_eq!(fs::read(game.fonts_dir().join("custom.ttf")).unwrap(), b"font");
        // An existing destination is never overwritten.
        assert_eq!(fs::read(game.fonts_dir().join("shipped.ttf")).unwrap(), b"new");
    }

    #[test]
    fn cancellation_mid_pass_aborts() {
        let (_temp, game) = game_with_sidecar();
        let previous_gfx = game.previous_version_dir().join("gfx");
        write_descriptor(&previous_gfx.join("A"), "tileset.txt", "x");
        write_descriptor(&previous_gfx.join("B"), "tileset.txt", "y");

        let cancel = CancelFlag::new();
        let cancel_cb = cancel.clone();
        let progress: ProgressFn = Arc::new(move |event| {
            if let ProgressEvent::Status { .. } = event {
                cancel_cb.cancel();
            }
        });
        let outcome =
            reconcile_assets(&game, &UpdateOptions::default(), &progress, &cancel).unwrap();
        assert_eq!(outcome, ReconcileOutcome::Aborted);
    }

    #[test]
    fn missing_sidecar_is_a_noop() {
        let temp = TempDir::new().unwrap();
        let game = GameDir::discover(temp.path());
        let outcome = reconcile_assets(
            &game,
            &UpdateOptions::default(),
            &sink(),
            &CancelFlag::new(),
        )
        .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Completed);
    }
}
