//! Catapult - Cataclysm: DDA launcher and build updater
//!
//! Hurls fresh experimental builds into your game directory while
//! keeping your saves, mods, tilesets and soundpacks intact.

pub mod backup;
pub mod catalog;
pub mod config;
pub mod copytree;
pub mod download;
pub mod extract;
pub mod fingerprint;
pub mod fsutil;
pub mod game_dir;
pub mod progress;
pub mod reconcile;
pub mod update;
pub mod verify;

/// Chunk size shared by every streaming file operation (fingerprinting,
/// tree copies). Progress granularity and cancellation latency both
/// follow from it.
pub const READ_BUFFER_SIZE: usize = 16 * 1024;
