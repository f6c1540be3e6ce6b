//! Install sessions and parameter validation.
//!
//! The bulk data path is out of line here: an [`Installer`] does the
//! actual image allocation and payload I/O, while the session decides
//! when those operations are legal and owns the terminal transitions
//! that leave durable markers behind.

use std::io::Read;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::error::StatusCode;
use crate::fstab::Fstab;
use crate::paths::{Paths, SECTOR_SIZE};
use crate::progress::ProgressUpdater;
use crate::statestore::{InstallStatus, StatusStore};

/// Parameters for one installation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallParams {
    /// Size of the system image payload, in bytes.
    pub gsi_size: u64,
    /// Size of the userdata image to allocate; 0 lets the installer
    /// pick a default.
    pub userdata_size: u64,
    /// Recreate userdata even if an image already exists.
    pub wipe_userdata: bool,
    /// Where the backing images go; empty means the default location.
    pub install_dir: Utf8PathBuf,
}

/// Handles an installer reports and polls through while doing bulk work.
#[derive(Clone)]
pub struct InstallerHooks {
    /// Progress sink, published under the progress lock.
    pub progress: ProgressUpdater,
    /// Cooperative abort flag; long-running loops must poll this.
    pub abort: Arc<AtomicBool>,
}

/// The external bulk writer. Implementations own partition-image
/// allocation and payload I/O; the orchestration layer only decides
/// when these operations are legal and what markers they leave behind.
pub trait Installer: Send {
    /// Allocate backing images and prepare to receive the payload.
    fn start(&mut self) -> StatusCode;
    /// Append `len` bytes read from `stream` to the system image.
    fn commit_chunk(&mut self, stream: &mut dyn Read, len: u64) -> bool;
    /// Append an in-memory chunk to the system image.
    fn commit_chunk_bytes(&mut self, data: &[u8]) -> bool;
    /// Flush and seal the written images.
    fn finalize_images(&mut self) -> StatusCode;
    /// Revalidate the images of an already-installed directory.
    fn reenable(&mut self) -> StatusCode;
    /// Destroy and recreate the userdata image.
    fn wipe_userdata(&mut self) -> StatusCode;
    /// The userdata size this installer computed.
    fn userdata_size(&self) -> u64;
    /// Directory holding the backing images.
    fn install_dir(&self) -> &Utf8Path;
}

/// One in-flight installation. At most one of these exists at a time,
/// owned by the service behind the orchestration lock; it does not
/// survive the process.
pub(crate) struct InstallSession {
    installer: Box<dyn Installer>,
}

impl InstallSession {
    pub(crate) fn new(installer: Box<dyn Installer>) -> Self {
        Self { installer }
    }

    pub(crate) fn start(&mut self) -> StatusCode {
        self.installer.start()
    }

    pub(crate) fn commit_chunk(&mut self, stream: &mut dyn Read, len: u64) -> bool {
        self.installer.commit_chunk(stream, len)
    }

    pub(crate) fn commit_chunk_bytes(&mut self, data: &[u8]) -> bool {
        self.installer.commit_chunk_bytes(data)
    }

    pub(crate) fn userdata_size(&self) -> u64 {
        self.installer.userdata_size()
    }

    pub(crate) fn install_dir(&self) -> &Utf8Path {
        self.installer.install_dir()
    }

    /// Terminal commit: seal the images, then persist the markers that
    /// make the install bootable. The attempt counter starts at zero
    /// and is only cleared once a boot has been confirmed successful.
    pub(crate) fn set_bootable(&mut self, one_shot: bool, store: &StatusStore) -> StatusCode {
        let status = self.installer.finalize_images();
        if !status.is_ok() {
            return status;
        }
        self.write_boot_markers(one_shot, store)
    }

    /// Terminal commit for the re-enable path. Trusts the images
    /// validated by the original install.
    pub(crate) fn reenable(&mut self, one_shot: bool, store: &StatusStore) -> StatusCode {
        let status = self.installer.reenable();
        if !status.is_ok() {
            return status;
        }
        self.write_boot_markers(one_shot, store)
    }

    pub(crate) fn wipe_userdata(&mut self) -> StatusCode {
        self.installer.wipe_userdata()
    }

    fn write_boot_markers(&self, one_shot: bool, store: &StatusStore) -> StatusCode {
        let r = store
            .set_one_shot_boot(one_shot)
            .and_then(|_| store.set_install_status(InstallStatus::Attempted(0)))
            .and_then(|_| store.set_installed_image_dir(self.installer.install_dir()));
        match r {
            Ok(()) => StatusCode::Ok,
            Err(e) => {
                tracing::error!("writing boot markers: {e:#}");
                StatusCode::GenericError
            }
        }
    }
}

/// Whether `path` refers to removable media: under the external mount
/// root and backed by a FAT filesystem.
fn is_external_storage_path(paths: &Paths, path: &Utf8Path) -> bool {
    if !path.starts_with(&paths.external_media_root) {
        return false;
    }
    let sfs = match rustix::fs::statfs(path.as_std_path()) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("statfs {path}: {e}");
            return false;
        }
    };
    sfs.f_type as i64 == libc::MSDOS_SUPER_MAGIC as i64
}

/// Validate and normalize install parameters. Returns the generic
/// install error on any violation; no side effects beyond normalizing
/// `params` in place.
pub(crate) fn validate_install_params(
    params: &mut InstallParams,
    paths: &Paths,
    fstab: &dyn Fstab,
) -> StatusCode {
    // Empty, or the top-level folder, means "pick for me": use the
    // default concrete subfolder.
    if params.install_dir.as_str().is_empty() || params.install_dir == paths.default_image_parent
    {
        params.install_dir = paths.default_image_dir.clone();
    }

    let requested = params.install_dir.clone();
    params.install_dir = match requested.canonicalize_utf8() {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("canonicalize {requested}: {e}");
            return StatusCode::GenericError;
        }
    };

    // Installs go to the default location or to removable media,
    // nothing else. Removable media additionally requires that the
    // system partition's integrity checking re-verifies on every read;
    // with check-at-most-once, swapped media would go unnoticed.
    if is_external_storage_path(paths, &params.install_dir) {
        match fstab.verity_check_at_most_once("/system") {
            Ok(false) => {}
            Ok(true) => {
                tracing::error!("cannot install to external media with check_at_most_once verity");
                return StatusCode::GenericError;
            }
            Err(e) => {
                tracing::error!("reading fstab: {e:#}");
                return StatusCode::GenericError;
            }
        }
    } else if params.install_dir != paths.default_image_dir {
        tracing::error!("cannot install GSI to {}", params.install_dir);
        return StatusCode::GenericError;
    }

    if params.gsi_size % SECTOR_SIZE != 0 {
        tracing::error!(
            "GSI size {} is not a multiple of {SECTOR_SIZE}",
            params.gsi_size
        );
        return StatusCode::GenericError;
    }
    if params.userdata_size % SECTOR_SIZE != 0 {
        tracing::error!(
            "userdata size {} is not a multiple of {SECTOR_SIZE}",
            params.userdata_size
        );
        return StatusCode::GenericError;
    }
    StatusCode::Ok
}
