//! File system abstraction for testability.
//!
//! Everything that touches the removable device or the local music library goes
//! through the [`FileSystem`] trait, so the write-safety and batch logic can be
//! exercised against the in-memory [`mock::MockFileSystem`], which records
//! every write it receives.

use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use sysinfo::Disks;
use walkdir::WalkDir;

use crate::error::{Error, FileSystemError, Result};

/// Converts an I/O error for read operations.
fn read_error(path: &Path, e: impl ToString) -> Error {
    Error::FileSystem(FileSystemError::ReadFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for write operations.
fn write_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::WriteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for directory creation.
fn create_dir_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::CreateDirFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for delete operations.
fn delete_error(path: &Path, e: io::Error) -> Error {
    Error::FileSystem(FileSystemError::DeleteFailed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Converts an I/O error for copy operations.
fn copy_error(src: &Path, dst: &Path, e: impl ToString) -> Error {
    Error::FileSystem(FileSystemError::CopyFailed {
        source_path: src.to_path_buf(),
        destination: dst.to_path_buf(),
        reason: e.to_string(),
    })
}

/// Abstraction over file system operations for testability.
pub trait FileSystem: Send + Sync {
    /// Read a file's contents as a string.
    fn read_to_string(&self, path: &Path) -> Result<String>;

    /// Write string contents to a file, creating or truncating it.
    fn write(&self, path: &Path, contents: &str) -> Result<()>;

    /// Check if a path exists.
    fn exists(&self, path: &Path) -> bool;

    /// Check if a path is a file.
    fn is_file(&self, path: &Path) -> bool;

    /// Check if a path is a directory.
    fn is_dir(&self, path: &Path) -> bool;

    /// Create a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Remove a file.
    fn remove_file(&self, path: &Path) -> Result<()>;

    /// List the immediate entries of a directory.
    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Copy a file from `src` to `dst`, preserving its modification time.
    fn copy(&self, src: &Path, dst: &Path) -> Result<u64>;

    /// Get file metadata (size, kind, modified time, permissions).
    fn metadata(&self, path: &Path) -> Result<FileMetadata>;

    /// Recursively list every entry below `path`.
    fn walk_dir(&self, path: &Path) -> Result<Vec<PathBuf>>;

    /// Bytes available to unprivileged writers on the filesystem holding `path`.
    fn available_space(&self, path: &Path) -> Result<u64>;
}

/// Simplified metadata structure for cross-platform compatibility.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes.
    pub len: u64,
    /// Whether this is a directory.
    pub is_dir: bool,
    /// Whether this is a file.
    pub is_file: bool,
    /// Last modified time.
    pub modified: Option<SystemTime>,
    /// Whether the permission bits forbid writing.
    pub read_only: bool,
}

impl FileMetadata {
    /// Create metadata from std::fs::Metadata.
    pub fn from_std(meta: &Metadata) -> Self {
        Self {
            len: meta.len(),
            is_dir: meta.is_dir(),
            is_file: meta.is_file(),
            modified: meta.modified().ok(),
            read_only: meta.permissions().readonly(),
        }
    }
}

/// Real file system implementation using std::fs.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealFileSystem;

impl RealFileSystem {
    /// Create a new real file system instance.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String> {
        fs::read_to_string(path).map_err(|e| read_error(path, e))
    }

    fn write(&self, path: &Path, contents: &str) -> Result<()> {
        fs::write(path, contents).map_err(|e| write_error(path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| create_dir_error(path, e))
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| delete_error(path, e))
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let entries = fs::read_dir(path).map_err(|e| read_error(path, e))?;
        Ok(entries.flatten().map(|e| e.path()).collect())
    }

    fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
        let bytes = fs::copy(src, dst).map_err(|e| copy_error(src, dst, e))?;

        // fs::copy keeps permissions but not timestamps
        let meta = fs::metadata(src).map_err(|e| read_error(src, e))?;
        let accessed = filetime::FileTime::from_last_access_time(&meta);
        let modified = filetime::FileTime::from_last_modification_time(&meta);
        filetime::set_file_times(dst, accessed, modified).map_err(|e| copy_error(src, dst, e))?;

        Ok(bytes)
    }

    fn metadata(&self, path: &Path) -> Result<FileMetadata> {
        let meta = fs::metadata(path).map_err(|e| read_error(path, e))?;
        Ok(FileMetadata::from_std(&meta))
    }

    fn walk_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        let mut results = Vec::new();
        for entry in WalkDir::new(path).min_depth(1).follow_links(true) {
            let entry = entry.map_err(|e| read_error(path, e))?;
            results.push(entry.into_path());
        }
        Ok(results)
    }

    fn available_space(&self, path: &Path) -> Result<u64> {
        let target = fs::canonicalize(path).map_err(|e| read_error(path, e))?;
        let disks = Disks::new_with_refreshed_list();

        // The disk with the longest mount point that prefixes the path owns it.
        disks
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(sysinfo::Disk::available_space)
            .ok_or_else(|| read_error(path, "no filesystem reports this path"))
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
pub mod mock {
    //! Mock file system for testing.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, RwLock};

    /// A mutating call recorded by [`MockFileSystem`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum MockOp {
        /// File write, copy destination or directory creation.
        Write(PathBuf),
        /// File removal.
        Remove(PathBuf),
    }

    /// In-memory mock file system for testing.
    ///
    /// Besides storing files, it records every mutating call and can be told to
    /// refuse writes below a path, report directories as read-only, limit free
    /// space, or "unplug" a mount after a number of copies.
    #[derive(Debug, Clone, Default)]
    pub struct MockFileSystem {
        files: Arc<RwLock<HashMap<PathBuf, Vec<u8>>>>,
        dirs: Arc<RwLock<HashSet<PathBuf>>>,
        journal: Arc<RwLock<Vec<MockOp>>>,
        denied: Arc<RwLock<HashSet<PathBuf>>>,
        read_only_dirs: Arc<RwLock<HashSet<PathBuf>>>,
        available: Arc<RwLock<Option<u64>>>,
        unplug: Arc<RwLock<Option<(PathBuf, usize)>>>,
    }

    impl MockFileSystem {
        /// Create a new empty mock file system with plenty of free space.
        #[must_use]
        pub fn new() -> Self {
            let fs = Self::default();
            fs.set_available_space(Some(u64::MAX));
            fs
        }

        /// Add a file with string contents.
        pub fn add_file(&self, path: impl AsRef<Path>, contents: &str) {
            self.add_file_bytes(path, contents.as_bytes());
        }

        /// Add a file with byte contents.
        pub fn add_file_bytes(&self, path: impl AsRef<Path>, contents: &[u8]) {
            let path = path.as_ref().to_path_buf();
            if let Some(parent) = path.parent() {
                self.add_dir(parent);
            }
            self.files
                .write()
                .expect("lock poisoned")
                .insert(path, contents.to_vec());
        }

        /// Add a directory and all of its ancestors.
        pub fn add_dir(&self, path: impl AsRef<Path>) {
            let mut dirs = self.dirs.write().expect("lock poisoned");
            for ancestor in path.as_ref().ancestors() {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                dirs.insert(ancestor.to_path_buf());
            }
        }

        /// Refuse every write at or below `path` with a permission error.
        pub fn deny_writes_under(&self, path: impl AsRef<Path>) {
            self.denied
                .write()
                .expect("lock poisoned")
                .insert(path.as_ref().to_path_buf());
        }

        /// Report `path` as a read-only directory in its metadata.
        pub fn mark_read_only(&self, path: impl AsRef<Path>) {
            self.read_only_dirs
                .write()
                .expect("lock poisoned")
                .insert(path.as_ref().to_path_buf());
        }

        /// Set the free space reported for every path (`None` makes the query fail).
        pub fn set_available_space(&self, bytes: Option<u64>) {
            *self.available.write().expect("lock poisoned") = bytes;
        }

        /// After `copies` more successful copies, wipe everything under `root`
        /// and fail the next copy, as if the device had been pulled out.
        pub fn unplug_after_copies(&self, root: impl AsRef<Path>, copies: usize) {
            *self.unplug.write().expect("lock poisoned") =
                Some((root.as_ref().to_path_buf(), copies));
        }

        /// Drop everything under `root` right away, as if the device had been
        /// pulled out between two calls.
        pub fn unplug(&self, root: impl AsRef<Path>) {
            self.remove_tree(root.as_ref());
        }

        /// Every mutating call, in order.
        #[must_use]
        pub fn journal(&self) -> Vec<MockOp> {
            self.journal.read().expect("lock poisoned").clone()
        }

        /// Every path that received a write, copy or directory creation, in order.
        #[must_use]
        pub fn writes(&self) -> Vec<PathBuf> {
            self.journal()
                .into_iter()
                .filter_map(|op| match op {
                    MockOp::Write(path) => Some(path),
                    MockOp::Remove(_) => None,
                })
                .collect()
        }

        /// Number of writes that targeted exactly `path`.
        #[must_use]
        pub fn writes_to(&self, path: impl AsRef<Path>) -> usize {
            let path = path.as_ref();
            self.writes().iter().filter(|p| p.as_path() == path).count()
        }

        /// Contents of a file, if present.
        #[must_use]
        pub fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
            self.files
                .read()
                .expect("lock poisoned")
                .get(path.as_ref())
                .cloned()
        }

        fn check_writable(&self, path: &Path) -> Result<()> {
            let denied = self.denied.read().expect("lock poisoned");
            if denied.iter().any(|d| path.starts_with(d)) {
                return Err(write_error(
                    path,
                    io::Error::new(io::ErrorKind::PermissionDenied, "Permission denied"),
                ));
            }
            Ok(())
        }

        fn record(&self, op: MockOp) {
            self.journal.write().expect("lock poisoned").push(op);
        }

        fn record_write(&self, path: &Path) {
            self.record(MockOp::Write(path.to_path_buf()));
        }

        fn remove_tree(&self, root: &Path) {
            self.files
                .write()
                .expect("lock poisoned")
                .retain(|p, _| !p.starts_with(root));
            self.dirs
                .write()
                .expect("lock poisoned")
                .retain(|p| !p.starts_with(root));
        }

        /// Returns true when this copy should fail because the device was unplugged.
        fn consume_unplug(&self) -> bool {
            let mut unplug = self.unplug.write().expect("lock poisoned");
            match unplug.as_mut() {
                Some((root, 0)) => {
                    let root = root.clone();
                    *unplug = None;
                    drop(unplug);
                    self.remove_tree(&root);
                    true
                }
                Some((_, remaining)) => {
                    *remaining -= 1;
                    false
                }
                None => false,
            }
        }
    }

    impl FileSystem for MockFileSystem {
        fn read_to_string(&self, path: &Path) -> Result<String> {
            let files = self.files.read().expect("lock poisoned");
            files
                .get(path)
                .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
                .ok_or_else(|| {
                    Error::FileSystem(FileSystemError::NotFound {
                        path: path.to_path_buf(),
                    })
                })
        }

        fn write(&self, path: &Path, contents: &str) -> Result<()> {
            self.check_writable(path)?;
            if let Some(parent) = path.parent()
                && !self.is_dir(parent)
            {
                return Err(write_error(
                    path,
                    io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
                ));
            }
            self.record_write(path);
            self.add_file(path, contents);
            Ok(())
        }

        fn exists(&self, path: &Path) -> bool {
            self.is_file(path) || self.is_dir(path)
        }

        fn is_file(&self, path: &Path) -> bool {
            self.files
                .read()
                .expect("lock poisoned")
                .contains_key(path)
        }

        fn is_dir(&self, path: &Path) -> bool {
            self.dirs.read().expect("lock poisoned").contains(path)
        }

        fn create_dir_all(&self, path: &Path) -> Result<()> {
            if self.is_dir(path) {
                return Ok(());
            }
            self.check_writable(path)
                .map_err(|e| create_dir_error(path, io::Error::other(e.to_string())))?;
            self.record_write(path);
            self.add_dir(path);
            Ok(())
        }

        fn remove_file(&self, path: &Path) -> Result<()> {
            let removed = self.files.write().expect("lock poisoned").remove(path);
            if removed.is_none() {
                return Err(delete_error(
                    path,
                    io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
                ));
            }
            self.record(MockOp::Remove(path.to_path_buf()));
            Ok(())
        }

        fn read_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
            if !self.is_dir(path) {
                return Err(Error::FileSystem(FileSystemError::NotFound {
                    path: path.to_path_buf(),
                }));
            }
            let files = self.files.read().expect("lock poisoned");
            let dirs = self.dirs.read().expect("lock poisoned");

            let mut entries: Vec<PathBuf> = files
                .keys()
                .chain(dirs.iter())
                .filter(|p| p.parent() == Some(path))
                .cloned()
                .collect();
            entries.sort();
            entries.dedup();
            Ok(entries)
        }

        fn copy(&self, src: &Path, dst: &Path) -> Result<u64> {
            let contents = self.contents(src).ok_or_else(|| {
                copy_error(
                    src,
                    dst,
                    io::Error::new(io::ErrorKind::NotFound, "source missing"),
                )
            })?;
            if self.consume_unplug() {
                return Err(copy_error(
                    src,
                    dst,
                    io::Error::new(io::ErrorKind::NotFound, "No such device"),
                ));
            }
            self.check_writable(dst)?;
            if let Some(parent) = dst.parent()
                && !self.is_dir(parent)
            {
                return Err(copy_error(
                    src,
                    dst,
                    io::Error::new(io::ErrorKind::NotFound, "No such file or directory"),
                ));
            }
            self.record_write(dst);
            self.add_file_bytes(dst, &contents);
            Ok(contents.len() as u64)
        }

        fn metadata(&self, path: &Path) -> Result<FileMetadata> {
            if let Some(contents) = self.contents(path) {
                return Ok(FileMetadata {
                    len: contents.len() as u64,
                    is_dir: false,
                    is_file: true,
                    modified: Some(SystemTime::UNIX_EPOCH),
                    read_only: false,
                });
            }
            if self.is_dir(path) {
                let read_only = self
                    .read_only_dirs
                    .read()
                    .expect("lock poisoned")
                    .contains(path);
                return Ok(FileMetadata {
                    len: 0,
                    is_dir: true,
                    is_file: false,
                    modified: Some(SystemTime::UNIX_EPOCH),
                    read_only,
                });
            }
            Err(Error::FileSystem(FileSystemError::NotFound {
                path: path.to_path_buf(),
            }))
        }

        fn walk_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
            let mut results = Vec::new();
            let mut pending = vec![path.to_path_buf()];
            while let Some(dir) = pending.pop() {
                for entry in self.read_dir(&dir)? {
                    if self.is_dir(&entry) {
                        pending.push(entry.clone());
                    }
                    results.push(entry);
                }
            }
            Ok(results)
        }

        fn available_space(&self, path: &Path) -> Result<u64> {
            self.available
                .read()
                .expect("lock poisoned")
                .ok_or_else(|| read_error(path, "statvfs failed"))
        }
    }
}
