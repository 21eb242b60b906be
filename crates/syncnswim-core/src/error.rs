//! Error types for SyncNSwim core operations.
//!
//! Errors are grouped by domain: device detection and write safety
//! ([`DeviceError`]), file system access ([`FileSystemError`]), per-item
//! transfers ([`TransferError`]) and podcast feeds ([`FeedError`]).

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in SyncNSwim core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Device detection or write-safety failure.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// File system operation failed.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// A single file transfer failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// Podcast feed could not be fetched, parsed or downloaded.
    #[error(transparent)]
    Feed(#[from] FeedError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal failure (e.g. an external command could not run).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Device related errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No mounted device matched the configured name pattern.
    #[error("Device not found: {name}")]
    NotFound {
        /// Name pattern that was searched for.
        name: String,
    },

    /// The mount point is no longer reachable.
    #[error("Device disconnected: {mount_point}")]
    Disconnected {
        /// Mount point that vanished.
        mount_point: PathBuf,
    },

    /// The kernel reports the mount as read-only.
    #[error("Device is mounted read-only: {mount_point} (device {device}, filesystem {file_system})")]
    ReadOnly {
        /// Mount point of the device.
        mount_point: PathBuf,
        /// Backing block device.
        device: String,
        /// Filesystem type.
        file_system: String,
    },

    /// A probe write to the mount root failed.
    #[error("Cannot write to {mount_point}: {reason}{}", ownership_hint(.ownership_options))]
    NotWritable {
        /// Path that refused the write.
        mount_point: PathBuf,
        /// Underlying error.
        reason: String,
        /// `uid=`/`gid=` mount options that may explain the refusal.
        ownership_options: Vec<String>,
    },

    /// Not enough free space on the device for a file.
    #[error("Insufficient space on {device}: {required_bytes} bytes needed, {available_bytes} bytes available")]
    InsufficientSpace {
        /// Device mount point.
        device: String,
        /// Bytes available.
        available_bytes: u64,
        /// Bytes needed.
        required_bytes: u64,
    },
}

fn ownership_hint(options: &[String]) -> String {
    if options.is_empty() {
        String::new()
    } else {
        format!(" (mount ownership options: {})", options.join(","))
    }
}

/// File system errors.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Path does not exist.
    #[error("Path not found: {path}")]
    NotFound {
        /// Missing path.
        path: PathBuf,
    },

    /// Reading failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path being read.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// Writing failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path being written.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// Directory creation failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Directory being created.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// Deletion failed.
    #[error("Failed to delete {path}: {reason}")]
    DeleteFailed {
        /// Path being deleted.
        path: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// Copy failed.
    #[error("Failed to copy {source_path} to {destination}: {reason}")]
    CopyFailed {
        /// Source file.
        source_path: PathBuf,
        /// Destination file.
        destination: PathBuf,
        /// Underlying error.
        reason: String,
    },

    /// A directory exists but is not writable.
    #[error("Directory is not writable: {path}")]
    NotWritable {
        /// Directory path.
        path: PathBuf,
    },
}

/// Per-item transfer errors.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Source file does not exist.
    #[error("Source file not found: {path}")]
    SourceNotFound {
        /// Missing source.
        path: PathBuf,
    },

    /// The destination file name could not be derived.
    #[error("Invalid destination name for {path}")]
    InvalidName {
        /// Source path.
        path: PathBuf,
    },
}

/// Podcast feed errors.
#[derive(Debug, Error)]
pub enum FeedError {
    /// HTTP request failed.
    #[error("Failed to fetch {url}: {reason}")]
    FetchFailed {
        /// Requested URL.
        url: String,
        /// Underlying error.
        reason: String,
    },

    /// Feed XML could not be parsed.
    #[error("Failed to parse feed {url}: {reason}")]
    ParseFailed {
        /// Feed URL.
        url: String,
        /// Parser error.
        reason: String,
    },
}

impl Error {
    /// Create a read-only device error.
    pub fn read_only(
        mount_point: impl Into<PathBuf>,
        device: impl Into<String>,
        file_system: impl Into<String>,
    ) -> Self {
        Self::Device(DeviceError::ReadOnly {
            mount_point: mount_point.into(),
            device: device.into(),
            file_system: file_system.into(),
        })
    }

    /// Create an insufficient space error.
    pub fn insufficient_space(device: &Path, available_bytes: u64, required_bytes: u64) -> Self {
        Self::Device(DeviceError::InsufficientSpace {
            device: device.display().to_string(),
            available_bytes,
            required_bytes,
        })
    }

    /// Create a feed fetch error.
    pub fn fetch_failed(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::Feed(FeedError::FetchFailed {
            url: url.into(),
            reason: reason.to_string(),
        })
    }

    /// Whether this error means the target device went away.
    #[must_use]
    pub const fn is_disconnect(&self) -> bool {
        matches!(self, Self::Device(DeviceError::Disconnected { .. }))
    }
}
