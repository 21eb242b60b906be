//! Batch sync passes.
//!
//! A music pass replaces the previous batch recorded in the device manifest:
//!
//! 1. Load the manifest (absent means empty).
//! 2. Remove every file it names.
//! 3. Select a new random sample.
//! 4. Copy each selected file.
//! 5. Save a manifest naming exactly the files that were copied.
//!
//! Per-item failures are logged and the pass continues. Losing the device
//! mid-batch aborts the pass and leaves the manifest untouched.
//!
//! A podcast pass downloads the latest episode of each enabled podcast and
//! copies it to the device. It never deletes anything.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::{AppConfig, PodcastSpec, SyncMode};
use crate::episode::EpisodeSource;
use crate::fs::FileSystem;
use crate::manifest::SyncManifest;
use crate::music::MusicSelector;
use crate::store::{WritableStore, sanitize_filename};

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Mode of the pass.
    pub mode: SyncMode,
    /// Files from the previous batch that were deleted.
    pub removed: usize,
    /// Files from the previous batch that could not be deleted.
    pub remove_failures: usize,
    /// Names of files now on the device from this pass, copied or skipped.
    pub placed: Vec<String>,
    /// How many of `placed` were already present with the same size.
    pub skipped: usize,
    /// Items that failed to fetch, download or copy.
    pub failed: usize,
    /// The device disappeared during the pass.
    pub device_lost: bool,
    /// Whether the manifest was rewritten.
    pub manifest_written: bool,
    /// Reason the pass stopped early, if it did.
    pub error_message: Option<String>,
    /// Wall time of the pass in milliseconds.
    pub duration_ms: u64,
}

impl SyncReport {
    fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    /// Whether the pass ran to completion without any failure.
    pub const fn success(&self) -> bool {
        self.failed == 0 && !self.device_lost && self.error_message.is_none()
    }

    /// One-line human summary.
    pub fn summary(&self) -> String {
        if self.device_lost {
            format!(
                "Sync aborted: device lost after {} file(s)",
                self.placed.len()
            )
        } else if let Some(ref error) = self.error_message {
            format!("Sync failed: {error}")
        } else {
            format!(
                "Sync completed ({}): {} file(s) on device ({} already present), {} removed, {} failed in {:.2}s",
                self.mode,
                self.placed.len(),
                self.skipped,
                self.removed,
                self.failed,
                self.duration_ms as f64 / 1000.0
            )
        }
    }
}

/// Runs sync passes against a [`WritableStore`].
pub struct BatchSyncManager {
    mode: SyncMode,
    fs: Arc<dyn FileSystem>,
    episodes: Arc<dyn EpisodeSource>,
    podcasts: Vec<PodcastSpec>,
    music: Option<MusicSelector>,
}

impl BatchSyncManager {
    /// Create a manager for `mode` with no podcasts and no music library.
    pub fn new(mode: SyncMode, fs: Arc<dyn FileSystem>, episodes: Arc<dyn EpisodeSource>) -> Self {
        Self {
            mode,
            fs,
            episodes,
            podcasts: Vec::new(),
            music: None,
        }
    }

    /// Create a manager from the application configuration.
    pub fn from_config(
        config: &AppConfig,
        fs: Arc<dyn FileSystem>,
        episodes: Arc<dyn EpisodeSource>,
    ) -> Self {
        let music = config.music.source_directory.as_ref().map(|dir| {
            MusicSelector::new(dir.clone(), config.music.sample_count, Arc::clone(&fs))
        });
        Self {
            podcasts: config.enabled_podcasts().cloned().collect(),
            music,
            ..Self::new(config.sync_mode, fs, episodes)
        }
    }

    /// Set the podcasts followed in podcast mode.
    #[must_use]
    pub fn with_podcasts(mut self, podcasts: Vec<PodcastSpec>) -> Self {
        self.podcasts = podcasts;
        self
    }

    /// Set the music library used in music mode.
    #[must_use]
    pub fn with_music(mut self, selector: MusicSelector) -> Self {
        self.music = Some(selector);
        self
    }

    /// Mode of the passes this manager runs.
    pub const fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Run one pass. Never panics or fails outright; problems are reported
    /// in the returned [`SyncReport`].
    pub fn sync(&self, store: &WritableStore) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::new(self.mode);

        info!(
            "Starting {} sync to {}",
            self.mode,
            store.mount_path().display()
        );
        if let Some(free) = store.free_space_bytes() {
            info!("Device free space: {:.2} MB", free as f64 / (1024.0 * 1024.0));
        }

        if let Err(e) = store.ensure_writable() {
            error!("Device is not writable: {}", e);
            report.device_lost = e.is_disconnect();
            report.error_message = Some(e.to_string());
        } else {
            match self.mode {
                SyncMode::Music => self.sync_music(store, &mut report),
                SyncMode::Podcasts => self.sync_podcasts(store, &mut report),
            }
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if report.success() {
            info!("{}", report.summary());
        } else {
            warn!("{}", report.summary());
        }
        report
    }

    fn sync_music(&self, store: &WritableStore, report: &mut SyncReport) {
        let manifest = SyncManifest::load(self.fs.as_ref(), store.mount_path());
        info!("Removing {} file(s) from the previous batch", manifest.files.len());
        for name in &manifest.files {
            match store.remove(name) {
                Ok(_) => report.removed += 1,
                Err(e) => {
                    warn!("Failed to remove {}: {}", name, e);
                    report.remove_failures += 1;
                }
            }
        }

        let selection = match &self.music {
            Some(selector) => selector.select(),
            None => {
                warn!("Music mode without a source directory, nothing to copy");
                Vec::new()
            }
        };

        for (source, name) in selection.iter().zip(distinct_names(&selection)) {
            match store.copy(source, name.as_deref()) {
                Ok(stored) => {
                    if stored.skipped {
                        report.skipped += 1;
                    }
                    report.placed.extend(stored.file_name());
                }
                Err(e) if e.is_disconnect() => {
                    error!("Device lost while copying {}: {}", source.display(), e);
                    report.device_lost = true;
                    return;
                }
                Err(e) => {
                    warn!("Failed to copy {}: {}", source.display(), e);
                    report.failed += 1;
                }
            }
        }

        match SyncManifest::new(report.placed.clone()).save(self.fs.as_ref(), store.mount_path()) {
            Ok(()) => report.manifest_written = true,
            Err(e) => {
                error!("Failed to save manifest: {}", e);
                report.error_message = Some(e.to_string());
            }
        }
    }

    fn sync_podcasts(&self, store: &WritableStore, report: &mut SyncReport) {
        if self.podcasts.is_empty() {
            info!("No enabled podcasts configured");
            return;
        }

        let mut downloaded: Vec<PathBuf> = Vec::new();
        for podcast in &self.podcasts {
            info!("Processing: {}", podcast.name);
            let episode = match self.episodes.latest_episode(&podcast.rss_url) {
                Ok(Some(episode)) => episode,
                Ok(None) => {
                    warn!("No downloadable episode in feed for {}", podcast.name);
                    report.failed += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to fetch feed for {}: {}", podcast.name, e);
                    report.failed += 1;
                    continue;
                }
            };

            info!("Latest episode: {} ({})", episode.title, episode.published);
            match self.episodes.download(&episode, &podcast.name) {
                Ok(path) => downloaded.push(path),
                Err(e) => {
                    warn!("Failed to download {}: {}", episode.title, e);
                    report.failed += 1;
                }
            }
        }

        let stored = store.copy_all(&downloaded);
        report.failed += downloaded.len() - stored.len();
        report.skipped += stored.iter().filter(|s| s.skipped).count();
        report
            .placed
            .extend(stored.iter().filter_map(|s| s.file_name()));
        if !store.is_attached() {
            report.device_lost = true;
        }
    }
}

/// Device file names for `sources`, renaming later files whose sanitized
/// name collides (ignoring case) with an earlier one: `track.mp3`,
/// `track_2.mp3`, ... `None` leaves nameless sources to `copy`.
fn distinct_names(sources: &[PathBuf]) -> Vec<Option<String>> {
    let mut taken: HashSet<String> = HashSet::new();
    sources
        .iter()
        .map(|source| {
            let base = sanitize_filename(&source.file_name()?.to_string_lossy());
            let mut name = base.clone();
            let mut n = 2;
            while !taken.insert(name.to_lowercase()) {
                name = sanitize_filename(&numbered(&base, n));
                n += 1;
            }
            Some(name)
        })
        .collect()
}

fn numbered(name: &str, n: usize) -> String {
    let path = Path::new(name);
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => {
            format!("{}_{n}.{}", stem.to_string_lossy(), ext.to_string_lossy())
        }
        _ => format!("{name}_{n}"),
    }
}

impl std::fmt::Debug for BatchSyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSyncManager")
            .field("mode", &self.mode)
            .field("podcasts", &self.podcasts.len())
            .field("music", &self.music.as_ref().map(MusicSelector::source_directory))
            .finish_non_exhaustive()
    }
}
