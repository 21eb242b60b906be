//! Device detection.
//!
//! [`DeviceLocator`] resolves a fuzzy device name to a mount path by asking an
//! ordered list of [`MountSource`] strategies for candidates and applying one
//! shared matching rule. Each source discovers mounts differently so that a
//! missing tool, a permission problem or an unlabeled filesystem on one path
//! does not hide the device:
//!
//! 1. [`BlockDeviceSource`]: `lsblk` over disk-like block devices.
//! 2. [`MountTableSource`]: the kernel mount table plus `blkid` labels.
//! 3. [`MediaDirectorySource`]: mount points under the removable-media parents.
//! 4. [`DiskFreeSource`]: the `df` report.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::thread;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info};

use crate::command::{CommandRunner, SystemCommandRunner, args};
use crate::error::Result;
use crate::mount::{MountInspector, MountRecord, ProcMountInspector, decode_escapes};

/// Parent directories under which removable media get mounted.
pub const REMOVABLE_MEDIA_PARENTS: &[&str] = &["/run/media", "/media", "/mnt"];

/// Kernel name prefixes of disk-like block devices.
const DISK_NAME_PREFIXES: &[&str] = &["sd", "mmcblk"];

/// `KEY="value"` pairs as printed by `lsblk -P`.
static LSBLK_PAIR: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"([A-Z:\-]+)="((?:[^"\\]|\\.)*)""#).ok());

/// Human-friendly device name, matched case-insensitively as a substring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    name_pattern: String,
    lowered: String,
}

impl DeviceTarget {
    /// Create a target from a name pattern such as `"Shokz"`.
    pub fn new(name_pattern: impl Into<String>) -> Self {
        let name_pattern = name_pattern.into();
        let lowered = name_pattern.trim().to_lowercase();
        Self {
            name_pattern,
            lowered,
        }
    }

    /// The pattern as configured.
    pub fn name_pattern(&self) -> &str {
        &self.name_pattern
    }

    /// Whether `candidate` contains the pattern, ignoring case.
    ///
    /// A blank pattern matches nothing.
    pub fn matches(&self, candidate: &str) -> bool {
        !self.lowered.is_empty() && candidate.to_lowercase().contains(&self.lowered)
    }
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name_pattern)
    }
}

/// A mounted filesystem offered by a [`MountSource`], with the strings the
/// target pattern is matched against, most specific first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountCandidate {
    /// Where the filesystem is mounted.
    pub mount_path: PathBuf,
    /// Match keys (label, path segment, ...).
    pub keys: Vec<String>,
}

impl MountCandidate {
    /// Create a candidate.
    pub fn new(mount_path: impl Into<PathBuf>, keys: Vec<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            keys,
        }
    }
}

/// One discovery strategy.
#[cfg_attr(test, mockall::automock)]
pub trait MountSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Enumerate candidate mounts. Errors are treated by the locator as
    /// "no candidates from this source".
    fn list_candidates(&self) -> Result<Vec<MountCandidate>>;
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    /// Mount path of the device.
    pub mount_path: PathBuf,
    /// Mount table entry, when the kernel table lists the path.
    pub mount_record: Option<MountRecord>,
}

fn last_segment(path: &Path) -> Option<String> {
    path.file_name().map(|name| name.to_string_lossy().into_owned())
}

fn under_removable_parent(path: &Path) -> bool {
    REMOVABLE_MEDIA_PARENTS
        .iter()
        .any(|parent| path.starts_with(parent) && path != Path::new(parent))
}

fn is_disk_name(name: &str) -> bool {
    DISK_NAME_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

/// Whole-device path for a partition (`/dev/sdb1` -> `/dev/sdb`,
/// `/dev/mmcblk0p1` -> `/dev/mmcblk0`). `None` when `device` is not a partition.
fn parent_device(device: &str) -> Option<&str> {
    let trimmed = device.trim_end_matches(|c: char| c.is_ascii_digit());
    if trimmed.len() == device.len() {
        return None;
    }
    if trimmed.starts_with("/dev/mmcblk") {
        // mmcblk0p1: the whole device keeps its trailing digit
        return trimmed.strip_suffix('p').filter(|whole| whole.len() > "/dev/mmcblk".len());
    }
    Some(trimmed)
}

/// Strategy 1: `lsblk` over disk-like block devices.
pub struct BlockDeviceSource {
    runner: Arc<dyn CommandRunner>,
}

impl BlockDeviceSource {
    /// Create the source.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn parse(output: &str) -> Vec<MountCandidate> {
        let Some(re) = LSBLK_PAIR.as_ref() else {
            return Vec::new();
        };

        output
            .lines()
            .filter_map(|line| {
                let mut name = None;
                let mut label = None;
                let mut mount = None;
                for caps in re.captures_iter(line) {
                    let value = decode_escapes(&caps[2]);
                    match &caps[1] {
                        "NAME" => name = Some(value),
                        "LABEL" => label = Some(value),
                        "MOUNTPOINT" | "MOUNTPOINTS" => mount = Some(value),
                        _ => {}
                    }
                }

                let name = name?;
                let mount = mount.filter(|m| !m.is_empty())?;
                if !is_disk_name(&name) {
                    return None;
                }

                let mount_path = PathBuf::from(mount);
                let mut keys: Vec<String> = label.into_iter().filter(|l| !l.is_empty()).collect();
                keys.extend(last_segment(&mount_path));
                Some(MountCandidate::new(mount_path, keys))
            })
            .collect()
    }
}

impl MountSource for BlockDeviceSource {
    fn name(&self) -> &'static str {
        "lsblk"
    }

    fn list_candidates(&self) -> Result<Vec<MountCandidate>> {
        let output = self
            .runner
            .run("lsblk", &args(&["-P", "-o", "NAME,LABEL,MOUNTPOINT,FSTYPE"]))?;
        Ok(Self::parse(&output))
    }
}

/// Strategy 2: block devices from the kernel mount table, labels from `blkid`.
pub struct MountTableSource {
    inspector: Arc<dyn MountInspector>,
    runner: Arc<dyn CommandRunner>,
}

impl MountTableSource {
    /// Create the source.
    pub fn new(inspector: Arc<dyn MountInspector>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { inspector, runner }
    }

    fn label(&self, device: &str) -> Option<String> {
        match self
            .runner
            .run("blkid", &args(&["-o", "value", "-s", "LABEL", device]))
        {
            Ok(out) => Some(out.trim().to_string()).filter(|l| !l.is_empty()),
            Err(e) => {
                debug!("No label for {}: {}", device, e);
                None
            }
        }
    }
}

impl MountSource for MountTableSource {
    fn name(&self) -> &'static str {
        "mount table"
    }

    fn list_candidates(&self) -> Result<Vec<MountCandidate>> {
        let table = self.inspector.current_mounts();
        let block_mounts: Vec<&MountRecord> = table
            .iter()
            .filter(|record| {
                let dev = record.device_path.as_str();
                dev.strip_prefix("/dev/").is_some_and(is_disk_name)
                    && under_removable_parent(&record.mount_path)
            })
            .collect();

        let mounted_devices: HashSet<&str> = block_mounts
            .iter()
            .map(|record| record.device_path.as_str())
            .collect();

        Ok(block_mounts
            .iter()
            .filter(|record| {
                parent_device(&record.device_path)
                    .is_none_or(|whole| !mounted_devices.contains(whole))
            })
            .map(|record| {
                let mut keys: Vec<String> = self.label(&record.device_path).into_iter().collect();
                keys.extend(last_segment(&record.mount_path));
                MountCandidate::new(record.mount_path.clone(), keys)
            })
            .collect())
    }
}

/// Strategy 3: direct children of the removable-media parents that are
/// mount points in their own right.
///
/// Extension: desktop automounters place devices at `/media/<user>/<label>`,
/// so each child that is not itself a mount point has its own children
/// checked as well. The search stops at that second level.
pub struct MediaDirectorySource {
    inspector: Arc<dyn MountInspector>,
    parents: Vec<PathBuf>,
}

impl MediaDirectorySource {
    /// Source over [`REMOVABLE_MEDIA_PARENTS`].
    pub fn new(inspector: Arc<dyn MountInspector>) -> Self {
        Self::with_parents(
            inspector,
            REMOVABLE_MEDIA_PARENTS.iter().map(PathBuf::from).collect(),
        )
    }

    /// Source over custom parent directories.
    pub const fn with_parents(inspector: Arc<dyn MountInspector>, parents: Vec<PathBuf>) -> Self {
        Self { inspector, parents }
    }

    fn subdirectories(dir: &Path) -> Vec<PathBuf> {
        match fs::read_dir(dir) {
            Ok(entries) => entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect(),
            Err(e) => {
                debug!("Cannot list {}: {}", dir.display(), e);
                Vec::new()
            }
        }
    }
}

#[cfg(unix)]
fn on_separate_filesystem(path: &Path, parent: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (fs::metadata(path), fs::metadata(parent)) {
        (Ok(child), Ok(parent)) => child.dev() != parent.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn on_separate_filesystem(_path: &Path, _parent: &Path) -> bool {
    false
}

impl MountSource for MediaDirectorySource {
    fn name(&self) -> &'static str {
        "media directories"
    }

    fn list_candidates(&self) -> Result<Vec<MountCandidate>> {
        let table = self.inspector.current_mounts();
        let is_mount = |path: &Path, parent: &Path| {
            table.is_mount_point(path) || on_separate_filesystem(path, parent)
        };

        let mut candidates = Vec::new();
        for parent in &self.parents {
            for child in Self::subdirectories(parent) {
                if is_mount(&child, parent) {
                    candidates.extend(last_segment(&child).map(|k| MountCandidate::new(&child, vec![k])));
                    continue;
                }
                for grandchild in Self::subdirectories(&child) {
                    if is_mount(&grandchild, &child) {
                        candidates.extend(
                            last_segment(&grandchild)
                                .map(|k| MountCandidate::new(&grandchild, vec![k])),
                        );
                    }
                }
            }
        }
        Ok(candidates)
    }
}

/// Strategy 4: the POSIX `df` report, restricted to removable-media parents.
pub struct DiskFreeSource {
    runner: Arc<dyn CommandRunner>,
}

impl DiskFreeSource {
    /// Create the source.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    fn parse(output: &str) -> Vec<MountCandidate> {
        output
            .lines()
            .skip(1)
            .filter_map(|line| {
                let parts: Vec<&str> = line.split_whitespace().collect();
                // Filesystem Type Blocks Used Available Capacity Mounted-on...
                if parts.len() < 7 {
                    return None;
                }
                let mount_path = PathBuf::from(parts[6..].join(" "));
                under_removable_parent(&mount_path).then(|| {
                    let key = mount_path.to_string_lossy().into_owned();
                    MountCandidate::new(mount_path, vec![key])
                })
            })
            .collect()
    }
}

impl MountSource for DiskFreeSource {
    fn name(&self) -> &'static str {
        "df"
    }

    fn list_candidates(&self) -> Result<Vec<MountCandidate>> {
        let output = self.runner.run("df", &args(&["-P", "-T"]))?;
        Ok(Self::parse(&output))
    }
}

/// Resolves a [`DeviceTarget`] to a mount path.
///
/// Nothing is cached: each call re-derives the answer from the OS so that a
/// remount under a different path is picked up.
pub struct DeviceLocator {
    target: DeviceTarget,
    inspector: Arc<dyn MountInspector>,
    sources: Vec<Box<dyn MountSource>>,
}

impl DeviceLocator {
    /// Locator using the system mount table and command line tools.
    pub fn system(target: DeviceTarget) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner::new());
        let inspector: Arc<dyn MountInspector> = Arc::new(ProcMountInspector::new());
        Self::with_sources(
            target,
            Arc::clone(&inspector),
            vec![
                Box::new(BlockDeviceSource::new(Arc::clone(&runner))),
                Box::new(MountTableSource::new(Arc::clone(&inspector), Arc::clone(&runner))),
                Box::new(MediaDirectorySource::new(Arc::clone(&inspector))),
                Box::new(DiskFreeSource::new(runner)),
            ],
        )
    }

    /// Locator over explicit sources, tried in order.
    pub fn with_sources(
        target: DeviceTarget,
        inspector: Arc<dyn MountInspector>,
        sources: Vec<Box<dyn MountSource>>,
    ) -> Self {
        Self {
            target,
            inspector,
            sources,
        }
    }

    /// The target being searched for.
    pub const fn target(&self) -> &DeviceTarget {
        &self.target
    }

    /// The mount inspector shared with the sources.
    pub fn inspector(&self) -> Arc<dyn MountInspector> {
        Arc::clone(&self.inspector)
    }

    /// Resolve the target. `None` means the device is not present.
    pub fn resolve(&self) -> Option<ResolvedMount> {
        for source in &self.sources {
            let candidates = match source.list_candidates() {
                Ok(candidates) => candidates,
                Err(e) => {
                    debug!("Detection via {} failed: {}", source.name(), e);
                    continue;
                }
            };

            let hit = candidates
                .into_iter()
                .find(|candidate| candidate.keys.iter().any(|key| self.target.matches(key)));

            if let Some(candidate) = hit {
                debug!(
                    "Found {} at {} via {}",
                    self.target,
                    candidate.mount_path.display(),
                    source.name()
                );
                let mount_record = self
                    .inspector
                    .current_mounts()
                    .lookup(&candidate.mount_path)
                    .cloned();
                return Some(ResolvedMount {
                    mount_path: candidate.mount_path,
                    mount_record,
                });
            }
        }

        debug!("Device {} not found by any method", self.target);
        None
    }

    /// Whether the target is currently mounted.
    pub fn is_mounted(&self) -> bool {
        self.resolve().is_some()
    }

    /// Block until the target resolves or `timeout` elapses, sleeping
    /// `poll_interval` between attempts.
    pub fn wait_for(&self, timeout: Duration, poll_interval: Duration) -> Option<ResolvedMount> {
        let started = Instant::now();
        info!("Waiting up to {:?} for {}", timeout, self.target);

        loop {
            if let Some(resolved) = self.resolve() {
                return Some(resolved);
            }
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                info!("Timed out waiting for {}", self.target);
                return None;
            }
            thread::sleep(poll_interval.min(timeout - elapsed));
        }
    }
}

impl fmt::Debug for DeviceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLocator")
            .field("target", &self.target)
            .field(
                "sources",
                &self.sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
