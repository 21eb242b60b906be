//! Live mount table inspection.
//!
//! The kernel mount table is re-read on every query; nothing here is cached.
//! Mount options are parsed once into a token set so that consumers ask
//! [`MountRecord::read_only`] instead of re-splitting option strings.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::Regex;
use tracing::debug;

use crate::command::{CommandRunner, SystemCommandRunner};

/// Default location of the kernel mount table.
pub const PROC_MOUNTS: &str = "/proc/mounts";

/// `<device> on <path> type <fstype> (<options>)`, as printed by `mount`.
static MOUNT_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(\S+) on (.+) type (\S+) \(([^)]*)\)\s*$").ok());

/// Parsed mount options as a set of discrete tokens (`rw`, `uid=1000`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions(BTreeSet<String>);

impl MountOptions {
    /// Parse a comma separated option string.
    pub fn parse(options: &str) -> Self {
        Self(
            options
                .split(',')
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(ToString::to_string)
                .collect(),
        )
    }

    /// Whether the exact token is present.
    pub fn contains(&self, token: &str) -> bool {
        self.0.contains(token)
    }

    /// `uid=`/`gid=` tokens, which often explain permission failures on FAT
    /// filesystems mounted for another user.
    pub fn ownership_tokens(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|token| token.starts_with("uid=") || token.starts_with("gid="))
            .cloned()
            .collect()
    }

    /// Iterate over all tokens in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(","))
    }
}

impl<S: AsRef<str>> FromIterator<S> for MountOptions {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(|s| s.as_ref().to_string()).collect())
    }
}

/// One entry of the live mount table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Backing device, e.g. `/dev/sdb1`.
    pub device_path: String,
    /// Where the filesystem is mounted, with escapes decoded.
    pub mount_path: PathBuf,
    /// Filesystem type, e.g. `vfat`.
    pub filesystem_type: String,
    /// Parsed mount options.
    pub options: MountOptions,
}

impl MountRecord {
    /// Whether the mount is read-only. Derived solely from the `ro` option.
    pub fn read_only(&self) -> bool {
        self.options.contains("ro")
    }
}

/// A snapshot of the mount table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountTable {
    records: Vec<MountRecord>,
}

impl MountTable {
    /// Build a table from records.
    pub const fn new(records: Vec<MountRecord>) -> Self {
        Self { records }
    }

    /// Parse `/proc/mounts` formatted text. Lines with fewer than four fields
    /// are skipped.
    pub fn parse_proc_mounts(text: &str) -> Self {
        let records = text
            .lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount_path = fields.next()?;
                let fs_type = fields.next()?;
                let options = fields.next()?;
                Some(MountRecord {
                    device_path: decode_escapes(device),
                    mount_path: PathBuf::from(decode_escapes(mount_path)),
                    filesystem_type: fs_type.to_string(),
                    options: MountOptions::parse(options),
                })
            })
            .collect();
        Self { records }
    }

    /// Parse the output of the `mount` command. Unrecognised lines are skipped.
    pub fn parse_mount_output(text: &str) -> Self {
        let Some(re) = MOUNT_LINE.as_ref() else {
            return Self::default();
        };
        let records = text
            .lines()
            .filter_map(|line| {
                let caps = re.captures(line)?;
                Some(MountRecord {
                    device_path: decode_escapes(&caps[1]),
                    mount_path: PathBuf::from(decode_escapes(&caps[2])),
                    filesystem_type: caps[3].to_string(),
                    options: MountOptions::parse(&caps[4]),
                })
            })
            .collect();
        Self { records }
    }

    /// Find the record mounted exactly at `mount_path`.
    ///
    /// When the same path is mounted more than once the last (topmost) entry wins.
    pub fn lookup(&self, mount_path: &Path) -> Option<&MountRecord> {
        self.records
            .iter()
            .rev()
            .find(|record| record.mount_path == mount_path)
    }

    /// Whether anything is mounted at `mount_path`.
    pub fn is_mount_point(&self, mount_path: &Path) -> bool {
        self.lookup(mount_path).is_some()
    }

    /// Iterate over records in table order.
    pub fn iter(&self) -> impl Iterator<Item = &MountRecord> {
        self.records.iter()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Decode `\040`-style octal and `\x20`-style hex escapes.
///
/// Invalid sequences are kept verbatim.
pub fn decode_escapes(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let octal = bytes.get(i + 1..i + 4).filter(|d| d.iter().all(|b| (b'0'..=b'7').contains(b)));
            if let Some(digits) = octal
                && let Ok(value) = u8::from_str_radix(&String::from_utf8_lossy(digits), 8)
            {
                out.push(value);
                i += 4;
                continue;
            }

            let hex = bytes
                .get(i + 1..i + 4)
                .filter(|d| d[0] == b'x' && d[1..].iter().all(u8::is_ascii_hexdigit));
            if let Some(digits) = hex
                && let Ok(value) = u8::from_str_radix(&String::from_utf8_lossy(&digits[1..]), 16)
            {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Source of the live mount table.
#[cfg_attr(test, mockall::automock)]
pub trait MountInspector: Send + Sync {
    /// Read the current mount table. Never fails: an unavailable source
    /// yields an empty table.
    fn current_mounts(&self) -> MountTable;
}

/// Reads `/proc/mounts`, falling back to the `mount` command.
pub struct ProcMountInspector {
    mounts_file: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl ProcMountInspector {
    /// Inspector over the system mount table.
    pub fn new() -> Self {
        Self::with_source(PROC_MOUNTS, Arc::new(SystemCommandRunner::new()))
    }

    /// Inspector reading an arbitrary mounts file with a custom command runner.
    pub fn with_source(mounts_file: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            mounts_file: mounts_file.into(),
            runner,
        }
    }
}

impl Default for ProcMountInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ProcMountInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcMountInspector")
            .field("mounts_file", &self.mounts_file)
            .finish_non_exhaustive()
    }
}

impl MountInspector for ProcMountInspector {
    fn current_mounts(&self) -> MountTable {
        match std::fs::read_to_string(&self.mounts_file) {
            Ok(text) => return MountTable::parse_proc_mounts(&text),
            Err(e) => debug!("Cannot read {}: {}", self.mounts_file.display(), e),
        }

        match self.runner.run("mount", &[]) {
            Ok(text) => MountTable::parse_mount_output(&text),
            Err(e) => {
                debug!("mount command unavailable: {}", e);
                MountTable::default()
            }
        }
    }
}
