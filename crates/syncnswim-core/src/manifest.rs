//! Device-resident record of the current music batch.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::fs::FileSystem;

/// Hidden manifest file at the device root.
pub const MANIFEST_FILE_NAME: &str = ".syncnswim_music.json";

/// File names placed on the device by the last music pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncManifest {
    /// File names, in copy order.
    #[serde(default)]
    pub files: Vec<String>,
    /// Number of entries in `files`.
    #[serde(default)]
    pub count: usize,
}

impl SyncManifest {
    /// Build a manifest whose `count` matches `files`.
    pub fn new(files: Vec<String>) -> Self {
        let count = files.len();
        Self { files, count }
    }

    /// Path of the manifest under `mount_path`.
    pub fn path_for(mount_path: &Path) -> PathBuf {
        mount_path.join(MANIFEST_FILE_NAME)
    }

    /// Load the manifest from the device root.
    ///
    /// An absent or unreadable manifest is treated as "no prior batch".
    pub fn load(fs: &dyn FileSystem, mount_path: &Path) -> Self {
        let path = Self::path_for(mount_path);
        if !fs.exists(&path) {
            debug!("No manifest at {}", path.display());
            return Self::default();
        }

        let parsed = fs
            .read_to_string(&path)
            .and_then(|text| serde_json::from_str::<Self>(&text).map_err(Into::into));
        match parsed {
            Ok(manifest) => Self::new(manifest.files),
            Err(e) => {
                warn!("Ignoring unreadable manifest {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Overwrite the manifest on the device root.
    pub fn save(&self, fs: &dyn FileSystem, mount_path: &Path) -> Result<()> {
        let path = Self::path_for(mount_path);
        let json = serde_json::to_string_pretty(&Self::new(self.files.clone()))?;
        fs.write(&path, &json)?;
        debug!("Saved manifest with {} file(s) to {}", self.files.len(), path.display());
        Ok(())
    }
}
