//! `SyncNSwim` Core Library
//!
//! This crate provides the core functionality for the `SyncNSwim` daemon:
//! - Mount table inspection and read-only diagnostics
//! - Fuzzy device detection across several discovery methods
//! - Write-safe file transfer onto the device
//! - Batch sync of podcast episodes or a rotating music sample
//! - Mount/unmount monitoring that triggers a pass on every mount
//! - Application configuration management
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result`], whose error type groups
//! failures by domain. See the [`error`] module for details.
//!
//! ```rust,ignore
//! use syncnswim_core::{DeviceLocator, DeviceTarget};
//!
//! let locator = DeviceLocator::system(DeviceTarget::new("openswim"));
//! if let Some(found) = locator.resolve() {
//!     println!("mounted at {}", found.mount_path.display());
//! }
//! ```

pub mod command;
pub mod config;
pub mod device;
pub mod episode;
pub mod error;
pub mod fs;
pub mod manifest;
pub mod monitor;
pub mod mount;
pub mod music;
pub mod store;
pub mod sync;

pub use command::{CommandRunner, SystemCommandRunner};
pub use config::{
    AppConfig, ConfigManager, MusicConfig, PodcastSpec, SyncMode, default_config_path,
};
pub use device::{
    BlockDeviceSource, DeviceLocator, DeviceTarget, DiskFreeSource, MediaDirectorySource,
    MountCandidate, MountSource, MountTableSource, REMOVABLE_MEDIA_PARENTS, ResolvedMount,
};
pub use episode::{Episode, EpisodeSource, FeedEpisodeSource, HTTP_TIMEOUT, parse_latest};
pub use error::{DeviceError, Error, FeedError, FileSystemError, Result, TransferError};
pub use fs::{FileMetadata, FileSystem, RealFileSystem};
pub use manifest::{MANIFEST_FILE_NAME, SyncManifest};
pub use monitor::{
    DEFAULT_HEARTBEAT_EVERY, DEFAULT_POLL_INTERVAL, DeviceMonitor, MonitorEvent, MonitorHandle,
    MonitorState, MonitorSummary, Transition,
};
pub use mount::{
    MountInspector, MountOptions, MountRecord, MountTable, PROC_MOUNTS, ProcMountInspector,
};
pub use music::{AUDIO_EXTENSIONS, MusicSelector, is_audio_file};
pub use store::{MAX_FILENAME_CHARS, StoredFile, WRITE_PROBE_FILE, WritableStore, sanitize_filename};
pub use sync::{BatchSyncManager, SyncReport};
