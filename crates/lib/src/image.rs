//! The backing-image management boundary, and the scoped sub-service
//! handed out over it.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ServiceError;
use crate::install::{InstallParams, Installer, InstallerHooks};

/// Named backing-image operations provided by the external image
/// manager: allocation, deletion, and device mapping for a directory
/// pair fixed at open time.
pub trait ImageManager: Send {
    /// Allocate a backing image of `size` bytes.
    fn create_backing_image(&mut self, name: &str, size: u64, flags: u32) -> Result<()>;
    /// Delete a backing image; true on success.
    fn delete_backing_image(&mut self, name: &str) -> bool;
    /// Map an image to a device path, waiting at most `timeout`.
    fn map_image_device(&mut self, name: &str, timeout: Duration) -> Result<Utf8PathBuf>;
    /// Unmap a previously mapped image; true on success.
    fn unmap_image_device(&mut self, name: &str) -> bool;
    /// Whether the named backing image exists.
    fn backing_image_exists(&self, name: &str) -> bool;
    /// Whether the named image is currently mapped.
    fn is_image_mapped(&self, name: &str) -> bool;
}

/// Factory for the two external collaborators. One implementation is
/// installed per service; tests and the CLI use the file-backed one in
/// [`crate::backend`].
pub trait Backend: Send + Sync {
    /// Open an image manager over a (metadata, data) directory pair.
    fn open_image_manager(
        &self,
        metadata_dir: &Utf8Path,
        data_dir: &Utf8Path,
    ) -> Result<Box<dyn ImageManager>>;

    /// Construct an installer for `params`.
    fn installer(
        &self,
        params: InstallParams,
        hooks: InstallerHooks,
    ) -> Result<Box<dyn Installer>>;
}

/// A scoped image service: exactly the image-manager operations, bound
/// to the directory pair validated at creation time and gated to the
/// single caller identity it was created for.
pub struct ImageService {
    manager: Mutex<Box<dyn ImageManager>>,
    uid: u32,
}

impl ImageService {
    pub(crate) fn new(manager: Box<dyn ImageManager>, uid: u32) -> Self {
        Self {
            manager: Mutex::new(manager),
            uid,
        }
    }

    fn check_uid(&self, uid: u32) -> Result<(), ServiceError> {
        if uid == self.uid {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied { uid })
        }
    }

    /// See [`ImageManager::create_backing_image`].
    pub fn create_backing_image(
        &self,
        uid: u32,
        name: &str,
        size: u64,
        flags: u32,
    ) -> Result<(), ServiceError> {
        self.check_uid(uid)?;
        let mut manager = self.manager.lock().unwrap();
        manager
            .create_backing_image(name, size, flags)
            .map_err(|e| ServiceError::Delegate {
                stage: "create backing image",
                source: e,
            })
    }

    /// See [`ImageManager::delete_backing_image`].
    pub fn delete_backing_image(&self, uid: u32, name: &str) -> Result<bool, ServiceError> {
        self.check_uid(uid)?;
        let mut manager = self.manager.lock().unwrap();
        Ok(manager.delete_backing_image(name))
    }

    /// See [`ImageManager::map_image_device`].
    pub fn map_image_device(
        &self,
        uid: u32,
        name: &str,
        timeout: Duration,
    ) -> Result<Utf8PathBuf, ServiceError> {
        self.check_uid(uid)?;
        let mut manager = self.manager.lock().unwrap();
        manager
            .map_image_device(name, timeout)
            .map_err(|e| ServiceError::Delegate {
                stage: "map image",
                source: e,
            })
    }

    /// See [`ImageManager::unmap_image_device`].
    pub fn unmap_image_device(&self, uid: u32, name: &str) -> Result<bool, ServiceError> {
        self.check_uid(uid)?;
        let mut manager = self.manager.lock().unwrap();
        Ok(manager.unmap_image_device(name))
    }

    /// See [`ImageManager::backing_image_exists`].
    pub fn backing_image_exists(&self, uid: u32, name: &str) -> Result<bool, ServiceError> {
        self.check_uid(uid)?;
        let manager = self.manager.lock().unwrap();
        Ok(manager.backing_image_exists(name))
    }

    /// See [`ImageManager::is_image_mapped`].
    pub fn is_image_mapped(&self, uid: u32, name: &str) -> Result<bool, ServiceError> {
        self.check_uid(uid)?;
        let manager = self.manager.lock().unwrap();
        Ok(manager.is_image_mapped(name))
    }
}
