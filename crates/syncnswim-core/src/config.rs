//! Application configuration management.
//!
//! Settings and the podcast list live in one JSON file. Every field has a
//! serde default so a partial or older file still loads.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, FileSystemError, Result};

/// What a sync pass puts on the device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Latest episode of each enabled podcast; nothing is deleted.
    #[default]
    Podcasts,
    /// Random music sample replacing the previous sample.
    Music,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Podcasts => write!(f, "podcasts"),
            Self::Music => write!(f, "music"),
        }
    }
}

impl FromStr for SyncMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "podcasts" | "podcast" => Ok(Self::Podcasts),
            "music" => Ok(Self::Music),
            other => Err(Error::Configuration(format!("Unknown sync mode: {other}"))),
        }
    }
}

/// A podcast feed to follow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodcastSpec {
    /// Display name, also the local download subdirectory.
    pub name: String,
    /// RSS feed URL; identifies the podcast.
    pub rss_url: String,
    /// Whether the podcast takes part in syncs.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PodcastSpec {
    /// Create an enabled podcast.
    pub fn new(name: impl Into<String>, rss_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rss_url: rss_url.into(),
            enabled: true,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Music sample settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MusicConfig {
    /// Library directory scanned recursively.
    #[serde(default)]
    pub source_directory: Option<PathBuf>,
    /// Files per sample.
    #[serde(default = "default_sample_count")]
    pub sample_count: usize,
}

const fn default_sample_count() -> usize {
    20
}

impl Default for MusicConfig {
    fn default() -> Self {
        Self {
            source_directory: None,
            sample_count: default_sample_count(),
        }
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    /// Device name pattern (case-insensitive substring of label or mount path).
    #[serde(default = "default_device_name", alias = "shokz_device_name")]
    pub device_name: String,
    /// Local directory for downloaded episodes.
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,
    /// Directory on the device receiving files; empty means the device root.
    #[serde(default = "default_device_music_directory")]
    pub device_music_directory: String,
    /// How long `sync --wait` waits for the device.
    #[serde(default = "default_wait_timeout", alias = "storage_wait_timeout")]
    pub storage_wait_timeout_secs: u64,
    /// What a sync pass does.
    #[serde(default)]
    pub sync_mode: SyncMode,
    /// Music sample settings.
    #[serde(default)]
    pub music: MusicConfig,
    /// Followed podcasts.
    #[serde(default = "default_podcasts")]
    pub podcasts: Vec<PodcastSpec>,
}

fn default_device_name() -> String {
    "Shokz".to_string()
}

fn default_download_directory() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_device_music_directory() -> String {
    "MUSIC".to_string()
}

const fn default_wait_timeout() -> u64 {
    30
}

fn default_podcasts() -> Vec<PodcastSpec> {
    vec![PodcastSpec::new(
        "This Week in Tech",
        "https://feeds.twit.tv/twit.xml",
    )]
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            download_directory: default_download_directory(),
            device_music_directory: default_device_music_directory(),
            storage_wait_timeout_secs: default_wait_timeout(),
            sync_mode: SyncMode::default(),
            music: MusicConfig::default(),
            podcasts: default_podcasts(),
        }
    }
}

impl AppConfig {
    /// Timeout for waiting on the device.
    pub const fn storage_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_wait_timeout_secs)
    }

    /// Podcasts that take part in syncs.
    pub fn enabled_podcasts(&self) -> impl Iterator<Item = &PodcastSpec> {
        self.podcasts.iter().filter(|p| p.enabled)
    }

    /// Check settings that a sync pass depends on.
    pub fn validate(&self) -> Result<()> {
        if self.device_name.trim().is_empty() {
            return Err(Error::Configuration(
                "device_name must not be empty".to_string(),
            ));
        }
        if self.sync_mode == SyncMode::Music && self.music.source_directory.is_none() {
            return Err(Error::Configuration(
                "music mode requires music.source_directory".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default config file location.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::data_local_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("syncnswim")
        .join("config.json")
}

/// Loads, edits and persists the configuration file.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    path: PathBuf,
    config: AppConfig,
}

impl ConfigManager {
    /// Load from the default location.
    pub fn open_default() -> Result<Self> {
        Self::open(default_config_path())
    }

    /// Load from `path`. A missing file yields defaults, which are written back.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if !path.exists() {
            debug!("Config file {} not found, using defaults", path.display());
            let manager = Self {
                path,
                config: AppConfig::default(),
            };
            if let Err(e) = manager.save() {
                warn!("Failed to save default config: {}", e);
            }
            return Ok(manager);
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            Error::FileSystem(FileSystemError::ReadFailed {
                path: path.clone(),
                reason: format!("Failed to read config file: {e}"),
            })
        })?;
        let config: AppConfig = serde_json::from_str(&content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config file: {e}")))?;

        info!("Loaded config from {}", path.display());
        Ok(Self { path, config })
    }

    /// Config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current configuration.
    pub const fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Write the configuration to disk.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::FileSystem(FileSystemError::CreateDirFailed {
                    path: parent.to_path_buf(),
                    reason: format!("Failed to create config directory: {e}"),
                })
            })?;
        }

        let content = serde_json::to_string_pretty(&self.config)?;
        fs::write(&self.path, content).map_err(|e| {
            Error::FileSystem(FileSystemError::WriteFailed {
                path: self.path.clone(),
                reason: format!("Failed to write config file: {e}"),
            })
        })?;

        debug!("Saved config to {}", self.path.display());
        Ok(())
    }

    /// All configured podcasts.
    pub fn podcasts(&self) -> &[PodcastSpec] {
        &self.config.podcasts
    }

    /// Podcasts that take part in syncs.
    pub fn enabled_podcasts(&self) -> Vec<PodcastSpec> {
        self.config.enabled_podcasts().cloned().collect()
    }

    /// Add an enabled podcast. A duplicate RSS URL is rejected.
    pub fn add_podcast(&mut self, name: &str, rss_url: &str) -> Result<()> {
        if self.config.podcasts.iter().any(|p| p.rss_url == rss_url) {
            return Err(Error::Configuration(format!(
                "Podcast with RSS URL {rss_url} already exists"
            )));
        }
        self.config.podcasts.push(PodcastSpec::new(name, rss_url));
        self.save()?;
        info!("Added podcast {}", name);
        Ok(())
    }

    /// Remove the podcast with `rss_url`, returning it.
    pub fn remove_podcast(&mut self, rss_url: &str) -> Result<PodcastSpec> {
        let index = self.position(rss_url)?;
        let removed = self.config.podcasts.remove(index);
        self.save()?;
        info!("Removed podcast {}", removed.name);
        Ok(removed)
    }

    /// Enable or disable the podcast with `rss_url`.
    pub fn set_podcast_enabled(&mut self, rss_url: &str, enabled: bool) -> Result<PodcastSpec> {
        let index = self.position(rss_url)?;
        self.config.podcasts[index].enabled = enabled;
        self.save()?;
        Ok(self.config.podcasts[index].clone())
    }

    /// Flip the enabled flag of the podcast with `rss_url`.
    pub fn toggle_podcast(&mut self, rss_url: &str) -> Result<PodcastSpec> {
        let index = self.position(rss_url)?;
        let enabled = !self.config.podcasts[index].enabled;
        self.set_podcast_enabled(rss_url, enabled)
    }

    /// Switch between podcast and music syncing.
    pub fn set_sync_mode(&mut self, mode: SyncMode) -> Result<()> {
        self.config.sync_mode = mode;
        self.save()?;
        info!("Sync mode set to {}", mode);
        Ok(())
    }

    fn position(&self, rss_url: &str) -> Result<usize> {
        self.config
            .podcasts
            .iter()
            .position(|p| p.rss_url == rss_url)
            .ok_or_else(|| {
                Error::Configuration(format!("Podcast with RSS URL '{rss_url}' not found"))
            })
    }
}
