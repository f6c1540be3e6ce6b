//! Durable install-state markers.
//!
//! A handful of single-value files under one directory record everything
//! that must survive a reboot: the install status slot, the one-shot
//! boot flag, the booted indicator, and the installed image directory.
//! Absence of a file is a meaningful state distinct from any value.
//! Values are re-read on every query; nothing is cached in memory, so a
//! killed process leaves no stale belief about install state.

use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::paths::{
    BOOTED_INDICATOR_FILE, INSTALL_DIR_FILE, INSTALL_STATUS_FILE, ONE_SHOT_BOOT_FILE,
};

/// The persisted install status.
///
/// Symbolic values and the numeric boot-attempt counter share a single
/// storage slot; parsing happens once, here, so the rest of the crate
/// only ever sees the tagged form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallStatus {
    /// Installed and permitted to boot.
    Ok,
    /// Pending removal on the next boot; overrides everything else.
    Wipe,
    /// Installed, but booting into the image is suppressed.
    Disabled,
    /// Installed with `n` unconfirmed boot attempts recorded so far.
    Attempted(u32),
}

impl FromStr for InstallStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ok" => Ok(Self::Ok),
            "wipe" => Ok(Self::Wipe),
            "disabled" => Ok(Self::Disabled),
            other => other
                .parse::<u32>()
                .map(Self::Attempted)
                .map_err(|_| anyhow!("unrecognized install status {other:?}")),
        }
    }
}

impl fmt::Display for InstallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Wipe => f.write_str("wipe"),
            Self::Disabled => f.write_str("disabled"),
            Self::Attempted(n) => write!(f, "{n}"),
        }
    }
}

/// Handle to the marker directory.
#[derive(Debug)]
pub struct StatusStore {
    dir: Dir,
    path: Utf8PathBuf,
}

impl StatusStore {
    /// Open the marker directory, creating it if necessary.
    #[context("Opening status store")]
    pub fn open(path: &Utf8Path) -> Result<Self> {
        std::fs::create_dir_all(path).with_context(|| format!("creating {path}"))?;
        let dir = Dir::open_ambient_dir(path, cap_std::ambient_authority())
            .with_context(|| format!("opening {path}"))?;
        Ok(Self {
            dir,
            path: path.to_owned(),
        })
    }

    /// Location of the marker directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn read_marker(&self, name: &str) -> Result<Option<String>> {
        match self.dir.read_to_string(name) {
            Ok(s) => Ok(Some(s.trim_end().to_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}/{name}", self.path)),
        }
    }

    fn remove_marker(&self, name: &str) -> Result<()> {
        match self.dir.remove_file(name) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}/{name}", self.path)),
        }
    }

    /// Whether an image is installed, i.e. the status slot exists.
    pub fn is_installed(&self) -> bool {
        self.dir.exists(INSTALL_STATUS_FILE)
    }

    /// Read and parse the status slot. `None` means not installed.
    pub fn install_status(&self) -> Result<Option<InstallStatus>> {
        let Some(raw) = self.read_marker(INSTALL_STATUS_FILE)? else {
            return Ok(None);
        };
        Ok(Some(raw.parse()?))
    }

    /// Replace the status slot. The write is a whole-file replacement so
    /// a crash can never leave a partially written value behind.
    #[context("Writing install status")]
    pub fn set_install_status(&self, status: InstallStatus) -> Result<()> {
        self.dir
            .atomic_write(INSTALL_STATUS_FILE, status.to_string().as_bytes())?;
        Ok(())
    }

    /// Whether single-boot semantics are requested.
    pub fn one_shot_boot(&self) -> bool {
        self.dir.exists(ONE_SHOT_BOOT_FILE)
    }

    /// Set or clear the one-shot flag.
    pub fn set_one_shot_boot(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.dir.atomic_write(ONE_SHOT_BOOT_FILE, b"1")?;
            Ok(())
        } else {
            self.remove_marker(ONE_SHOT_BOOT_FILE)
        }
    }

    /// Whether the currently running environment is the GSI.
    pub fn is_booted_into_gsi(&self) -> bool {
        self.dir.exists(BOOTED_INDICATOR_FILE)
    }

    /// Record that the running system is the GSI.
    pub fn set_booted_indicator(&self) -> Result<()> {
        self.dir.atomic_write(BOOTED_INDICATOR_FILE, b"1")?;
        Ok(())
    }

    /// Remove the booted indicator, reverting the classification of the
    /// running environment to "original system".
    pub fn clear_booted_indicator(&self) -> Result<()> {
        self.remove_marker(BOOTED_INDICATOR_FILE)
    }

    /// Directory recorded for the current install, if any.
    pub fn installed_image_dir(&self) -> Option<Utf8PathBuf> {
        match self.read_marker(INSTALL_DIR_FILE) {
            Ok(v) => v.map(Utf8PathBuf::from),
            Err(e) => {
                tracing::error!("reading {INSTALL_DIR_FILE}: {e:#}");
                None
            }
        }
    }

    /// Record where the backing images live.
    #[context("Writing install dir")]
    pub fn set_installed_image_dir(&self, dir: &Utf8Path) -> Result<()> {
        self.dir.atomic_write(INSTALL_DIR_FILE, dir.as_str().as_bytes())?;
        Ok(())
    }

    /// Remove the install markers (status, one-shot flag, install dir).
    /// Best effort; returns false if any removal failed.
    pub fn remove_install_markers(&self) -> bool {
        let mut ok = true;
        for name in [INSTALL_STATUS_FILE, ONE_SHOT_BOOT_FILE, INSTALL_DIR_FILE] {
            if let Err(e) = self.remove_marker(name) {
                tracing::error!("{e:#}");
                ok = false;
            }
        }
        ok
    }
}
