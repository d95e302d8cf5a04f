//! Avatar listing collaborators
//!
//! The router treats avatars as opaque filenames: it needs "what names
//! exist" and "pick one at random", never file contents. `DirAvatars`
//! answers from a directory of `.png` files; `FixedAvatars` answers from a
//! fixed list and backs the test suites.

use log::warn;
use rand::seq::SliceRandom;
use std::path::PathBuf;

pub trait AvatarProvider: Send + Sync {
    /// Lists the avatar filenames clients may choose from.
    fn available(&self) -> Vec<String>;

    /// Picks one available avatar at random, or None if none exist.
    fn pick_random(&self) -> Option<String> {
        self.available().choose(&mut rand::thread_rng()).cloned()
    }
}

/// Lists `.png` filenames from an avatar directory.
pub struct DirAvatars {
    dir: PathBuf,
}

impl DirAvatars {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl AvatarProvider for DirAvatars {
    fn available(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Avatar directory {} unreadable: {}", self.dir.display(), e);
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| name.ends_with(".png"))
            .collect();
        names.sort();
        names
    }
}

/// Serves a fixed avatar list without touching the filesystem.
pub struct FixedAvatars {
    names: Vec<String>,
}

impl FixedAvatars {
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    /// A provider with no avatars at all; registration then assigns none.
    pub fn empty() -> Self {
        Self { names: Vec::new() }
    }
}

impl AvatarProvider for FixedAvatars {
    fn available(&self) -> Vec<String> {
        self.names.clone()
    }
}
