//! Filesystem-table lookup.
//!
//! Just enough fstab parsing to answer the one question install
//! validation asks: does the verity configuration of a mount point use
//! check-at-most-once semantics? Installing to removable media is
//! unsafe in that mode, because integrity violations would go unnoticed
//! after the first read.

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

/// Lookup interface for filesystem-table metadata. The production
/// implementation reads the device fstab; tests substitute a stub.
pub trait Fstab: Send + Sync {
    /// Whether the entry for `mount_point` carries the
    /// `check_at_most_once` verity flag.
    fn verity_check_at_most_once(&self, mount_point: &str) -> Result<bool>;
}

/// One parsed fstab line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    /// Source device or image.
    pub device: String,
    /// Where it gets mounted.
    pub mount_point: String,
    /// Filesystem type.
    pub fs_type: String,
    /// Mount options.
    pub mount_flags: String,
    /// Manager flags (the fifth column), comma separated.
    pub fs_mgr_flags: String,
}

impl FstabEntry {
    /// Whether the manager flag list contains `flag`.
    pub fn has_fs_mgr_flag(&self, flag: &str) -> bool {
        self.fs_mgr_flags.split(',').any(|f| f.trim() == flag)
    }
}

/// Parse fstab content, skipping blank lines and `#` comments.
pub fn parse(content: &str) -> Result<Vec<FstabEntry>> {
    let mut entries = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut it = line.split_whitespace();
        let (Some(device), Some(mount_point), Some(fs_type), Some(mount_flags)) =
            (it.next(), it.next(), it.next(), it.next())
        else {
            return Err(anyhow!("malformed fstab line {}", lineno + 1));
        };
        entries.push(FstabEntry {
            device: device.to_owned(),
            mount_point: mount_point.to_owned(),
            fs_type: fs_type.to_owned(),
            mount_flags: mount_flags.to_owned(),
            fs_mgr_flags: it.next().unwrap_or("").to_owned(),
        });
    }
    Ok(entries)
}

/// [`Fstab`] backed by a file on disk, re-read per query.
#[derive(Debug)]
pub struct DiskFstab {
    path: Utf8PathBuf,
}

impl DiskFstab {
    /// Read entries from `path` when queried.
    pub fn new(path: &Utf8Path) -> Self {
        Self {
            path: path.to_owned(),
        }
    }

    fn entries(&self) -> Result<Vec<FstabEntry>> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading {}", self.path))?;
        parse(&content)
    }
}

impl Fstab for DiskFstab {
    fn verity_check_at_most_once(&self, mount_point: &str) -> Result<bool> {
        let entries = self.entries()?;
        let entry = entries
            .iter()
            .find(|e| e.mount_point == mount_point)
            .ok_or_else(|| anyhow!("no fstab entry for {mount_point}"))?;
        Ok(entry.has_fs_mgr_flag("check_at_most_once"))
    }
}
