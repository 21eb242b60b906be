//! Random music sample selection.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::Rng;
use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::fs::FileSystem;

/// Extensions (lowercase, without dot) treated as audio.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "flac", "ogg", "wav", "wma", "opus"];

/// Whether `path` has an audio extension, ignoring case.
pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| AUDIO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Picks a random batch of audio files from a library directory.
#[derive(Clone)]
pub struct MusicSelector {
    source_directory: PathBuf,
    count: usize,
    fs: Arc<dyn FileSystem>,
}

impl MusicSelector {
    /// Create a selector over `source_directory` drawing `count` files.
    pub fn new(source_directory: impl Into<PathBuf>, count: usize, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            source_directory: source_directory.into(),
            count,
            fs,
        }
    }

    /// Library root.
    pub fn source_directory(&self) -> &Path {
        &self.source_directory
    }

    /// Every audio file below the library root, sorted. A missing or
    /// unreadable root yields an empty list.
    pub fn find_all(&self) -> Vec<PathBuf> {
        if !self.fs.is_dir(&self.source_directory) {
            warn!("Music directory {} does not exist", self.source_directory.display());
            return Vec::new();
        }

        match self.fs.walk_dir(&self.source_directory) {
            Ok(entries) => {
                let mut files: Vec<PathBuf> = entries
                    .into_iter()
                    .filter(|path| is_audio_file(path) && self.fs.is_file(path))
                    .collect();
                files.sort();
                files
            }
            Err(e) => {
                warn!("Error scanning {}: {}", self.source_directory.display(), e);
                Vec::new()
            }
        }
    }

    /// Draw a batch using the thread RNG.
    pub fn select(&self) -> Vec<PathBuf> {
        self.select_with_rng(&mut rand::thread_rng())
    }

    /// Draw a batch: everything when the library holds at most `count` files,
    /// otherwise `count` distinct files chosen uniformly.
    pub fn select_with_rng<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<PathBuf> {
        let all = self.find_all();
        if all.is_empty() {
            info!("No music files found in {}", self.source_directory.display());
            return all;
        }
        if all.len() <= self.count {
            info!("Found {} music file(s), selecting all", all.len());
            return all;
        }

        let selected: Vec<PathBuf> = all.choose_multiple(rng, self.count).cloned().collect();
        info!(
            "Found {} music files, randomly selected {}",
            all.len(),
            selected.len()
        );
        selected
    }
}
