//! Well-known paths and tunables.
//!
//! Everything externally meaningful is collected here so that tests (and
//! development runs) can re-root the whole layout onto a scratch
//! directory.

use camino::{Utf8Path, Utf8PathBuf};

/// Marker file holding the install status slot.
pub const INSTALL_STATUS_FILE: &str = "install_status";
/// Marker file whose presence requests single-boot semantics.
pub const ONE_SHOT_BOOT_FILE: &str = "one_shot_boot";
/// Marker file created by the running GSI once it has taken over.
pub const BOOTED_INDICATOR_FILE: &str = "booted";
/// Marker file recording where the backing images live.
pub const INSTALL_DIR_FILE: &str = "install_dir";

/// Backing image holding the system partition payload.
pub const SYSTEM_IMAGE: &str = "system_gsi";
/// Backing image holding the image's userdata filesystem.
pub const USERDATA_IMAGE: &str = "userdata_gsi";

/// Requested image sizes must be a multiple of this.
pub const SECTOR_SIZE: u64 = 512;

/// The filesystem layout the service operates on. `Default` is the
/// production layout rooted at `/`.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Directory holding the marker files.
    pub metadata_dir: Utf8PathBuf,
    /// Root under which per-install image metadata lives; also the
    /// containment prefix for scoped image services.
    pub image_metadata_root: Utf8PathBuf,
    /// The top-level install folder callers may name to mean "default".
    pub default_image_parent: Utf8PathBuf,
    /// The concrete subfolder installs go to by default.
    pub default_image_dir: Utf8PathBuf,
    /// Mount root for removable media.
    pub external_media_root: Utf8PathBuf,
    /// Block device backing userdata while the image is running.
    pub userdata_block_device: Utf8PathBuf,
    /// Filesystem table consulted during install validation.
    pub fstab: Utf8PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            metadata_dir: "/metadata/gsi/dsu".into(),
            image_metadata_root: "/metadata/gsi".into(),
            default_image_parent: "/data/gsi".into(),
            default_image_dir: "/data/gsi/dsu".into(),
            external_media_root: "/mnt/media_rw".into(),
            userdata_block_device: "/dev/block/mapper/userdata_gsi".into(),
            fstab: "/etc/fstab".into(),
        }
    }
}

impl Paths {
    /// The production layout re-rooted under `root`.
    pub fn under(root: &Utf8Path) -> Self {
        Self {
            metadata_dir: root.join("metadata/gsi/dsu"),
            image_metadata_root: root.join("metadata/gsi"),
            default_image_parent: root.join("data/gsi"),
            default_image_dir: root.join("data/gsi/dsu"),
            external_media_root: root.join("mnt/media_rw"),
            userdata_block_device: root.join("dev/userdata_gsi"),
            fstab: root.join("etc/fstab"),
        }
    }
}
