//! Safe writes to a mounted device.
//!
//! [`WritableStore`] is bound to one mount path and one target subdirectory.
//! Every copy re-runs the write-safety preflight ([`WritableStore::ensure_writable`]):
//! read-only mounts are refused without touching the device, a probe file
//! proves the root accepts writes, and the subdirectory is created on demand.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::device::ResolvedMount;
use crate::error::{DeviceError, Error, FileSystemError, Result, TransferError};
use crate::fs::FileSystem;
use crate::mount::MountInspector;

/// Hidden file written and deleted at the mount root to prove writability.
pub const WRITE_PROBE_FILE: &str = ".syncnswim_write_test";

/// Longest file name, in characters, written to the device.
pub const MAX_FILENAME_CHARS: usize = 200;

/// A file placed on (or already present on) the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredFile {
    /// Local source file.
    pub source: PathBuf,
    /// Path on the device.
    pub destination: PathBuf,
    /// Size in bytes.
    pub size_bytes: u64,
    /// Whether an identical-size file was already there and the copy was skipped.
    pub skipped: bool,
}

impl StoredFile {
    /// File name of the destination.
    pub fn file_name(&self) -> Option<String> {
        self.destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
    }
}

/// Replace every character that is not alphanumeric, space, `-`, `_` or `.`
/// with `_`, then cap the length at [`MAX_FILENAME_CHARS`] keeping the extension.
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();

    let len = sanitized.chars().count();
    if len <= MAX_FILENAME_CHARS {
        return sanitized;
    }

    // Extension starts at the last dot, unless that dot leads the name.
    let ext_start = sanitized
        .rfind('.')
        .filter(|&i| sanitized[..i].chars().any(|c| c != '.'));

    match ext_start {
        Some(i) if sanitized[i..].chars().count() < MAX_FILENAME_CHARS => {
            let ext = &sanitized[i..];
            let keep = MAX_FILENAME_CHARS - ext.chars().count();
            let stem: String = sanitized[..i].chars().take(keep).collect();
            format!("{stem}{ext}")
        }
        _ => sanitized.chars().take(MAX_FILENAME_CHARS).collect(),
    }
}

/// A writable view of one directory on a mounted device.
#[derive(Clone)]
pub struct WritableStore {
    mount_path: PathBuf,
    target_dir: PathBuf,
    fs: Arc<dyn FileSystem>,
    inspector: Arc<dyn MountInspector>,
    requires_mount_entry: bool,
}

impl WritableStore {
    /// Bind a store to `mount_path`/`subdirectory`. An empty subdirectory
    /// means the mount root.
    pub fn new(
        mount_path: impl Into<PathBuf>,
        subdirectory: &str,
        fs: Arc<dyn FileSystem>,
        inspector: Arc<dyn MountInspector>,
    ) -> Self {
        let mount_path = mount_path.into();
        let subdirectory = subdirectory.trim_matches('/');
        let target_dir = if subdirectory.is_empty() {
            mount_path.clone()
        } else {
            mount_path.join(subdirectory)
        };
        Self {
            mount_path,
            target_dir,
            fs,
            inspector,
            requires_mount_entry: false,
        }
    }

    /// Bind a store to a located device.
    ///
    /// When the mount table listed the device, the entry must stay listed:
    /// once it is gone the store reports the device as detached, even if the
    /// empty mount point directory is still there.
    pub fn for_mount(
        resolved: &ResolvedMount,
        subdirectory: &str,
        fs: Arc<dyn FileSystem>,
        inspector: Arc<dyn MountInspector>,
    ) -> Self {
        let mut store = Self::new(resolved.mount_path.clone(), subdirectory, fs, inspector);
        store.requires_mount_entry = resolved.mount_record.is_some();
        store
    }

    /// Mount root of the device.
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Directory files are written to.
    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Run the write-safety preflight.
    ///
    /// Fails with [`DeviceError::Disconnected`] when the device is gone,
    /// [`DeviceError::ReadOnly`] when the mount carries `ro` (no write is
    /// attempted in either case), [`DeviceError::NotWritable`] when the test
    /// write fails, or a file system error when the target directory cannot
    /// be used.
    pub fn ensure_writable(&self) -> Result<()> {
        let table = self.inspector.current_mounts();
        let record = table.lookup(&self.mount_path);

        if !self.fs.is_dir(&self.mount_path) || (self.requires_mount_entry && record.is_none()) {
            return Err(self.disconnected());
        }

        if let Some(record) = record
            && record.read_only()
        {
            return Err(Error::read_only(
                &self.mount_path,
                &record.device_path,
                &record.filesystem_type,
            ));
        }

        let probe = self.mount_path.join(WRITE_PROBE_FILE);
        if let Err(e) = self.fs.write(&probe, "test") {
            return Err(Error::Device(DeviceError::NotWritable {
                mount_point: self.mount_path.clone(),
                reason: e.to_string(),
                ownership_options: record
                    .map(|r| r.options.ownership_tokens())
                    .unwrap_or_default(),
            }));
        }
        if let Err(e) = self.fs.remove_file(&probe) {
            debug!("Could not remove write probe: {}", e);
        }

        if self.fs.is_dir(&self.target_dir) {
            let meta = self.fs.metadata(&self.target_dir)?;
            if meta.read_only {
                return Err(Error::FileSystem(FileSystemError::NotWritable {
                    path: self.target_dir.clone(),
                }));
            }
            return Ok(());
        }

        self.fs.create_dir_all(&self.target_dir)?;
        info!("Created directory {}", self.target_dir.display());
        Ok(())
    }

    /// Boolean view of [`Self::ensure_writable`]; the reason is logged.
    pub fn is_writable(&self) -> bool {
        match self.ensure_writable() {
            Ok(()) => true,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }

    /// Bytes available on the device, or `None` when the query fails.
    pub fn free_space_bytes(&self) -> Option<u64> {
        match self.fs.available_space(&self.mount_path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                debug!("Free space unavailable for {}: {}", self.mount_path.display(), e);
                None
            }
        }
    }

    /// Whether the mount root is still reachable and, for a store bound with
    /// [`Self::for_mount`], still listed in the mount table.
    pub fn is_attached(&self) -> bool {
        self.fs.is_dir(&self.mount_path)
            && (!self.requires_mount_entry
                || self.inspector.current_mounts().is_mount_point(&self.mount_path))
    }

    fn disconnected(&self) -> Error {
        Error::Device(DeviceError::Disconnected {
            mount_point: self.mount_path.clone(),
        })
    }

    /// Whether `filename` exists in the target directory.
    pub fn exists(&self, filename: &str) -> bool {
        self.fs.exists(&self.target_dir.join(filename))
    }

    /// Copy `source` into the target directory.
    ///
    /// The destination name defaults to the source's file name and is always
    /// sanitized. An existing file of the same size is left alone and reported
    /// as skipped; a different size is overwritten. Free space is checked
    /// before anything is written.
    pub fn copy(&self, source: &Path, destination_name: Option<&str>) -> Result<StoredFile> {
        if !self.fs.is_file(source) {
            return Err(Error::Transfer(TransferError::SourceNotFound {
                path: source.to_path_buf(),
            }));
        }

        self.ensure_writable()?;

        let raw_name = match destination_name {
            Some(name) => name.to_string(),
            None => source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    Error::Transfer(TransferError::InvalidName {
                        path: source.to_path_buf(),
                    })
                })?,
        };
        let name = sanitize_filename(&raw_name);
        if name.is_empty() || name.chars().all(|c| c == '.') {
            return Err(Error::Transfer(TransferError::InvalidName {
                path: source.to_path_buf(),
            }));
        }

        let destination = self.target_dir.join(&name);
        let size_bytes = self.fs.metadata(source)?.len;

        if self.fs.is_file(&destination) {
            let existing = self.fs.metadata(&destination)?.len;
            if existing == size_bytes {
                debug!("{} already on device with same size, skipping", name);
                return Ok(StoredFile {
                    source: source.to_path_buf(),
                    destination,
                    size_bytes,
                    skipped: true,
                });
            }
            info!(
                "{} exists with different size ({} vs {} bytes), overwriting",
                name, existing, size_bytes
            );
        }

        if let Some(available) = self.free_space_bytes()
            && size_bytes > available
        {
            return Err(Error::insufficient_space(&self.mount_path, available, size_bytes));
        }

        if let Err(e) = self.fs.copy(source, &destination) {
            if self.fs.exists(&destination)
                && let Err(cleanup) = self.fs.remove_file(&destination)
            {
                warn!("Could not remove partial copy {}: {}", destination.display(), cleanup);
            }
            if !self.is_attached() {
                return Err(self.disconnected());
            }
            return Err(e);
        }

        info!("Copied {} to {}", source.display(), destination.display());
        Ok(StoredFile {
            source: source.to_path_buf(),
            destination,
            size_bytes,
            skipped: false,
        })
    }

    /// Copy each source, logging and dropping individual failures.
    pub fn copy_all(&self, sources: &[PathBuf]) -> Vec<StoredFile> {
        sources
            .iter()
            .filter_map(|source| match self.copy(source, None) {
                Ok(stored) => Some(stored),
                Err(e) => {
                    warn!("Failed to copy {}: {}", source.display(), e);
                    None
                }
            })
            .collect()
    }

    /// File names directly inside the target directory, sorted.
    /// A missing directory yields an empty list.
    pub fn list_files(&self) -> Result<Vec<String>> {
        if !self.fs.is_dir(&self.target_dir) {
            return Ok(Vec::new());
        }
        let mut names: Vec<String> = self
            .fs
            .read_dir(&self.target_dir)?
            .into_iter()
            .filter(|path| self.fs.is_file(path))
            .filter_map(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delete `filename` from the target directory.
    ///
    /// Returns `Ok(false)` when the file was already gone. Names with path
    /// components are rejected so a tampered manifest cannot reach outside
    /// the target directory.
    pub fn remove(&self, filename: &str) -> Result<bool> {
        let plain = Path::new(filename)
            .file_name()
            .is_some_and(|name| name == filename);
        if !plain {
            return Err(Error::Transfer(TransferError::InvalidName {
                path: PathBuf::from(filename),
            }));
        }

        let path = self.target_dir.join(filename);
        if !self.fs.exists(&path) {
            debug!("{} already removed", filename);
            return Ok(false);
        }
        self.fs.remove_file(&path)?;
        debug!("Removed {}", path.display());
        Ok(true)
    }
}

impl fmt::Debug for WritableStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WritableStore")
            .field("mount_path", &self.mount_path)
            .field("target_dir", &self.target_dir)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::mount::{MockMountInspector, MountOptions, MountRecord, MountTable};

    const MOUNT: &str = "/media/pi/SWIM PRO";

    fn inspector(options: &'static str) -> Arc<dyn MountInspector> {
        let mut inspector = MockMountInspector::new();
        inspector.expect_current_mounts().returning(move || {
            MountTable::new(vec![MountRecord {
                device_path: "/dev/sda1".to_string(),
                mount_path: PathBuf::from(MOUNT),
                filesystem_type: "vfat".to_string(),
                options: MountOptions::parse(options),
            }])
        });
        Arc::new(inspector)
    }

    fn setup(options: &'static str) -> (MockFileSystem, WritableStore) {
        let fs = MockFileSystem::new();
        fs.add_dir(MOUNT);
        let store = WritableStore::new(MOUNT, "MUSIC", Arc::new(fs.clone()), inspector(options));
        (fs, store)
    }

    fn dest(name: &str) -> PathBuf {
        Path::new(MOUNT).join("MUSIC").join(name)
    }

    #[test]
    fn test_read_only_mount_refused_without_writes() {
        let (fs, store) = setup("ro,nosuid,uid=1000");
        fs.add_file("/music/a.mp3", "aaaa");

        let err = store.ensure_writable().unwrap_err();
        assert!(matches!(err, Error::Device(DeviceError::ReadOnly { .. })));
        assert!(!store.is_writable());

        assert!(store.copy(Path::new("/music/a.mp3"), None).is_err());
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn test_probe_failure_reports_ownership_options() {
        let (fs, store) = setup("rw,uid=1000,gid=1000");
        fs.deny_writes_under(MOUNT);

        let err = store.ensure_writable().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Permission denied"));
        assert!(msg.contains("uid=1000"));
        assert!(!fs.is_dir(&dest("")));
    }

    #[test]
    fn test_ensure_writable_creates_subdirectory_and_cleans_probe() {
        let (fs, store) = setup("rw");
        store.ensure_writable().unwrap();

        assert!(fs.is_dir(Path::new(MOUNT).join("MUSIC").as_path()));
        assert!(!fs.exists(&Path::new(MOUNT).join(WRITE_PROBE_FILE)));
    }

    #[test]
    fn test_read_only_subdirectory_refused() {
        let (fs, store) = setup("rw");
        fs.add_dir(Path::new(MOUNT).join("MUSIC"));
        fs.mark_read_only(Path::new(MOUNT).join("MUSIC"));

        let err = store.ensure_writable().unwrap_err();
        assert!(matches!(err, Error::FileSystem(FileSystemError::NotWritable { .. })));
    }

    #[test]
    fn test_subdirectory_creation_failure_reported() {
        let (fs, store) = setup("rw");
        fs.deny_writes_under(Path::new(MOUNT).join("MUSIC"));

        let err = store.ensure_writable().unwrap_err();
        assert!(matches!(err, Error::FileSystem(FileSystemError::CreateDirFailed { .. })));
    }

    #[test]
    fn test_empty_subdirectory_targets_root() {
        let fs = MockFileSystem::new();
        fs.add_dir(MOUNT);
        fs.add_file("/music/a.mp3", "aaaa");
        let store = WritableStore::new(MOUNT, "", Arc::new(fs.clone()), inspector("rw"));

        let stored = store.copy(Path::new("/music/a.mp3"), None).unwrap();
        assert_eq!(stored.destination, Path::new(MOUNT).join("a.mp3"));
    }

    #[test]
    fn test_copy_is_idempotent() {
        let (fs, store) = setup("rw");
        fs.add_file("/music/song.mp3", "0123456789");

        let first = store.copy(Path::new("/music/song.mp3"), None).unwrap();
        let second = store.copy(Path::new("/music/song.mp3"), None).unwrap();

        assert_eq!(first.destination, second.destination);
        assert!(!first.skipped);
        assert!(second.skipped);
        assert_eq!(fs.writes_to(dest("song.mp3")), 1);
    }

    #[test]
    fn test_copy_overwrites_when_size_differs() {
        let (fs, store) = setup("rw");
        fs.add_file("/music/song.mp3", "new longer content");
        fs.add_file(dest("song.mp3"), "old");

        let stored = store.copy(Path::new("/music/song.mp3"), None).unwrap();
        assert!(!stored.skipped);
        assert_eq!(fs.contents(dest("song.mp3")).unwrap(), b"new longer content");
    }

    #[test]
    fn test_copy_refused_when_space_insufficient() {
        let (fs, store) = setup("rw");
        fs.add_file("/music/big.mp3", "0123456789");
        fs.set_available_space(Some(5));

        let err = store.copy(Path::new("/music/big.mp3"), None).unwrap_err();
        assert!(matches!(
            err,
            Error::Device(DeviceError::InsufficientSpace {
                available_bytes: 5,
                required_bytes: 10,
                ..
            })
        ));
        assert_eq!(fs.writes_to(dest("big.mp3")), 0);
        assert!(!fs.exists(&dest("big.mp3")));
    }

    #[test]
    fn test_copy_proceeds_when_space_unknown() {
        let (fs, store) = setup("rw");
        fs.add_file("/music/a.mp3", "aaaa");
        fs.set_available_space(None);

        assert!(store.copy(Path::new("/music/a.mp3"), None).is_ok());
        assert_eq!(store.free_space_bytes(), None);
    }

    #[test]
    fn test_copy_missing_source() {
        let (fs, store) = setup("rw");
        let err = store.copy(Path::new("/music/missing.mp3"), None).unwrap_err();
        assert!(matches!(err, Error::Transfer(TransferError::SourceNotFound { .. })));
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn test_copy_sanitizes_destination_name() {
        let (fs, store) = setup("rw");
        fs.add_file("/podcasts/ep.mp3", "x");

        let stored = store
            .copy(Path::new("/podcasts/ep.mp3"), Some("Ep #12: Q&A!.mp3"))
            .unwrap();
        assert_eq!(stored.file_name().unwrap(), "Ep _12_ Q_A_.mp3");
    }

    #[test]
    fn test_copy_reports_lost_device() {
        let (fs, store) = setup("rw");
        fs.add_file("/music/a.mp3", "a");
        fs.add_file("/music/b.mp3", "b");
        fs.unplug_after_copies(MOUNT, 1);

        store.copy(Path::new("/music/a.mp3"), None).unwrap();
        let err = store.copy(Path::new("/music/b.mp3"), None).unwrap_err();
        assert!(err.is_disconnect());
        assert!(!store.is_attached());
    }

    #[test]
    fn test_copy_after_unplug_reports_lost_device_without_writing() {
        let (fs, store) = setup("rw");
        fs.add_file("/music/a.mp3", "a");
        fs.add_file("/music/b.mp3", "b");

        store.copy(Path::new("/music/a.mp3"), None).unwrap();
        fs.unplug(MOUNT);
        let writes_before = fs.writes().len();

        let err = store.copy(Path::new("/music/b.mp3"), None).unwrap_err();
        assert!(err.is_disconnect(), "{err}");
        assert_eq!(fs.writes().len(), writes_before);
    }

    #[test]
    fn test_failed_copy_cleans_destination_and_keeps_cause() {
        let (fs, store) = setup("rw");
        fs.add_file("/music/a.mp3", "aaaa");
        fs.add_file(Path::new(MOUNT).join("MUSIC").join("a.mp3"), "a");
        fs.deny_writes_under(Path::new(MOUNT).join("MUSIC").join("a.mp3"));

        let err = store.copy(Path::new("/music/a.mp3"), None).unwrap_err();
        assert!(!err.is_disconnect());
        assert!(matches!(err, Error::FileSystem(_)));
        assert!(!store.exists("a.mp3"));
        assert!(store.is_attached());
    }

    fn resolved_with_record() -> ResolvedMount {
        ResolvedMount {
            mount_path: PathBuf::from(MOUNT),
            mount_record: Some(MountRecord {
                device_path: "/dev/sda1".to_string(),
                mount_path: PathBuf::from(MOUNT),
                filesystem_type: "vfat".to_string(),
                options: MountOptions::parse("rw"),
            }),
        }
    }

    #[test]
    fn test_for_mount_writes_while_listed() {
        let fs = MockFileSystem::new();
        fs.add_dir(MOUNT);
        fs.add_file("/music/a.mp3", "a");
        let store = WritableStore::for_mount(
            &resolved_with_record(),
            "MUSIC",
            Arc::new(fs.clone()),
            inspector("rw"),
        );

        assert!(store.is_attached());
        store.copy(Path::new("/music/a.mp3"), None).unwrap();
        assert!(fs.exists(&dest("a.mp3")));
    }

    #[test]
    fn test_for_mount_refuses_leftover_mount_point() {
        let fs = MockFileSystem::new();
        fs.add_dir(MOUNT);
        fs.add_file("/music/a.mp3", "a");
        let mut unmounted = MockMountInspector::new();
        unmounted
            .expect_current_mounts()
            .returning(MountTable::default);
        let store = WritableStore::for_mount(
            &resolved_with_record(),
            "MUSIC",
            Arc::new(fs.clone()),
            Arc::new(unmounted),
        );

        assert!(!store.is_attached());
        assert!(store.ensure_writable().unwrap_err().is_disconnect());
        let err = store.copy(Path::new("/music/a.mp3"), None).unwrap_err();
        assert!(err.is_disconnect(), "{err}");
        assert!(fs.journal().is_empty());
    }

    #[test]
    fn test_copy_all_skips_failures() {
        let (fs, store) = setup("rw");
        fs.add_file("/music/a.mp3", "a");
        fs.add_file("/music/c.mp3", "c");

        let stored = store.copy_all(&[
            PathBuf::from("/music/a.mp3"),
            PathBuf::from("/music/b.mp3"),
            PathBuf::from("/music/c.mp3"),
        ]);
        let names: Vec<String> = stored.iter().filter_map(StoredFile::file_name).collect();
        assert_eq!(names, vec!["a.mp3", "c.mp3"]);
    }

    #[test]
    fn test_list_and_remove() {
        let (fs, store) = setup("rw");
        assert!(store.list_files().unwrap().is_empty());

        fs.add_file(dest("b.mp3"), "b");
        fs.add_file(dest("a.mp3"), "a");
        fs.add_dir(dest("nested"));
        assert_eq!(store.list_files().unwrap(), vec!["a.mp3", "b.mp3"]);
        assert!(store.exists("a.mp3"));

        assert!(store.remove("a.mp3").unwrap());
        assert!(!store.remove("a.mp3").unwrap());
        assert_eq!(store.list_files().unwrap(), vec!["b.mp3"]);
    }

    #[test]
    fn test_remove_rejects_paths() {
        let (_fs, store) = setup("rw");
        assert!(store.remove("../escape.mp3").is_err());
        assert!(store.remove("sub/file.mp3").is_err());
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Ep #12: Q&A!.mp3"), "Ep _12_ Q_A_.mp3");
        assert_eq!(sanitize_filename("plain-name_1.mp3"), "plain-name_1.mp3");
        assert_eq!(sanitize_filename("a/b\\c.mp3"), "a_b_c.mp3");
    }

    #[test]
    fn test_sanitize_truncates_keeping_extension() {
        let long = format!("{}.mp3", "x".repeat(256));
        let sanitized = sanitize_filename(&long);
        assert!(sanitized.chars().count() <= MAX_FILENAME_CHARS);
        assert_eq!(sanitized.chars().count(), MAX_FILENAME_CHARS);
        assert!(sanitized.ends_with(".mp3"));
    }

    #[test]
    fn test_sanitize_truncates_without_extension() {
        let sanitized = sanitize_filename(&"y".repeat(260));
        assert_eq!(sanitized.chars().count(), MAX_FILENAME_CHARS);
    }
}
