//! File-backed reference installer and image manager.
//!
//! Backing images are plain preallocated files named `<name>.img` in
//! the data directory. This is a demo-grade bulk writer for the CLI and
//! the end-to-end tests; a production deployment substitutes its own
//! [`Installer`]/[`ImageManager`] pair through [`Backend`].

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::error::StatusCode;
use crate::image::{Backend, ImageManager};
use crate::install::{InstallParams, Installer, InstallerHooks};
use crate::paths::{SYSTEM_IMAGE, USERDATA_IMAGE};
use crate::progress::ProgressStatus;

/// Userdata size used when the request leaves it at zero.
const DEFAULT_USERDATA_SIZE: u64 = 1 << 30;
/// Copy granularity for chunk commits; the abort flag is polled between
/// blocks.
const COPY_BLOCK_SIZE: usize = 64 * 1024;

fn image_path(data_dir: &Utf8Path, name: &str) -> Utf8PathBuf {
    data_dir.join(format!("{name}.img"))
}

/// File-per-image manager.
pub struct FileImageManager {
    data_dir: Utf8PathBuf,
    mapped: HashSet<String>,
}

impl FileImageManager {
    /// Open a manager over the given directory pair, creating the
    /// directories if needed.
    #[context("Opening image manager")]
    pub fn open(metadata_dir: &Utf8Path, data_dir: &Utf8Path) -> Result<Self> {
        // File-backed images keep no separate metadata; the directory
        // only has to exist so callers can rely on the pair.
        std::fs::create_dir_all(metadata_dir)
            .with_context(|| format!("creating {metadata_dir}"))?;
        std::fs::create_dir_all(data_dir).with_context(|| format!("creating {data_dir}"))?;
        Ok(Self {
            data_dir: data_dir.to_owned(),
            mapped: HashSet::new(),
        })
    }
}

impl ImageManager for FileImageManager {
    fn create_backing_image(&mut self, name: &str, size: u64, _flags: u32) -> Result<()> {
        let path = image_path(&self.data_dir, name);
        let f = File::create(&path).with_context(|| format!("creating {path}"))?;
        f.set_len(size)
            .with_context(|| format!("allocating {size} bytes for {path}"))?;
        Ok(())
    }

    fn delete_backing_image(&mut self, name: &str) -> bool {
        self.mapped.remove(name);
        let path = image_path(&self.data_dir, name);
        match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("removing {path}: {e}");
                false
            }
        }
    }

    fn map_image_device(&mut self, name: &str, _timeout: Duration) -> Result<Utf8PathBuf> {
        let path = image_path(&self.data_dir, name);
        if !path.exists() {
            bail!("no backing image named {name}");
        }
        self.mapped.insert(name.to_owned());
        Ok(path)
    }

    fn unmap_image_device(&mut self, name: &str) -> bool {
        self.mapped.remove(name)
    }

    fn backing_image_exists(&self, name: &str) -> bool {
        image_path(&self.data_dir, name).exists()
    }

    fn is_image_mapped(&self, name: &str) -> bool {
        self.mapped.contains(name)
    }
}

/// Demo bulk writer: allocates the two images, then streams the system
/// payload into the system image file.
pub struct FileInstaller {
    params: InstallParams,
    metadata_dir: Utf8PathBuf,
    hooks: InstallerHooks,
    userdata_size: u64,
    system: Option<File>,
    bytes_written: u64,
    finished: bool,
}

impl FileInstaller {
    fn new(metadata_dir: &Utf8Path, params: InstallParams, hooks: InstallerHooks) -> Self {
        let userdata_size = if params.userdata_size == 0 {
            DEFAULT_USERDATA_SIZE
        } else {
            params.userdata_size
        };
        Self {
            params,
            metadata_dir: metadata_dir.to_owned(),
            hooks,
            userdata_size,
            system: None,
            bytes_written: 0,
            finished: false,
        }
    }

    fn manager(&self) -> Result<FileImageManager> {
        FileImageManager::open(&self.metadata_dir, &self.params.install_dir)
    }

    #[context("Allocating images")]
    fn allocate_images(&mut self) -> Result<()> {
        let mut manager = self.manager()?;

        self.hooks
            .progress
            .start_async_operation("allocate_userdata", self.userdata_size);
        if self.params.wipe_userdata || !manager.backing_image_exists(USERDATA_IMAGE) {
            if manager.backing_image_exists(USERDATA_IMAGE)
                && !manager.delete_backing_image(USERDATA_IMAGE)
            {
                bail!("could not remove existing userdata image");
            }
            manager.create_backing_image(USERDATA_IMAGE, self.userdata_size, 0)?;
        } else {
            // Keep the existing userdata; report its actual size.
            let path = image_path(&self.params.install_dir, USERDATA_IMAGE);
            self.userdata_size = std::fs::metadata(&path)
                .with_context(|| format!("inspecting {path}"))?
                .len();
        }
        self.hooks
            .progress
            .update(ProgressStatus::Complete, self.userdata_size);

        self.hooks
            .progress
            .start_async_operation("allocate_system", self.params.gsi_size);
        if manager.backing_image_exists(SYSTEM_IMAGE)
            && !manager.delete_backing_image(SYSTEM_IMAGE)
        {
            bail!("could not remove existing system image");
        }
        manager.create_backing_image(SYSTEM_IMAGE, self.params.gsi_size, 0)?;
        self.hooks
            .progress
            .update(ProgressStatus::Complete, self.params.gsi_size);

        let path = image_path(&self.params.install_dir, SYSTEM_IMAGE);
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("opening {path}"))?;
        self.system = Some(file);
        Ok(())
    }
}

impl Installer for FileInstaller {
    fn start(&mut self) -> StatusCode {
        if let Err(e) = self.allocate_images() {
            tracing::error!("starting install: {e:#}");
            return StatusCode::GenericError;
        }
        self.hooks
            .progress
            .start_async_operation("write_system", self.params.gsi_size);
        StatusCode::Ok
    }

    fn commit_chunk(&mut self, stream: &mut dyn Read, len: u64) -> bool {
        if len > self.params.gsi_size - self.bytes_written {
            tracing::error!("chunk of {len} bytes overflows the remaining image space");
            return false;
        }
        let Some(system) = self.system.as_mut() else {
            return false;
        };
        let mut remaining = len;
        let mut buf = [0u8; COPY_BLOCK_SIZE];
        while remaining > 0 {
            if self.hooks.abort.load(Ordering::SeqCst) {
                tracing::warn!("abort requested, stopping chunk commit");
                return false;
            }
            let want = remaining.min(COPY_BLOCK_SIZE as u64) as usize;
            let n = match stream.read(&mut buf[..want]) {
                Ok(0) => {
                    tracing::error!("payload stream ended early");
                    return false;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::error!("reading payload: {e}");
                    return false;
                }
            };
            if let Err(e) = system.write_all(&buf[..n]) {
                tracing::error!("writing system image: {e}");
                return false;
            }
            remaining -= n as u64;
            self.bytes_written += n as u64;
            self.hooks
                .progress
                .update(ProgressStatus::Working, self.bytes_written);
        }
        true
    }

    fn commit_chunk_bytes(&mut self, data: &[u8]) -> bool {
        let mut cursor = data;
        self.commit_chunk(&mut cursor, data.len() as u64)
    }

    fn finalize_images(&mut self) -> StatusCode {
        if self.bytes_written != self.params.gsi_size {
            tracing::error!(
                "cannot finalize: wrote {} of {} bytes",
                self.bytes_written,
                self.params.gsi_size
            );
            return StatusCode::GenericError;
        }
        let Some(system) = self.system.take() else {
            return StatusCode::GenericError;
        };
        if let Err(e) = system.sync_all() {
            tracing::error!("syncing system image: {e}");
            return StatusCode::GenericError;
        }
        self.hooks
            .progress
            .update(ProgressStatus::Complete, self.bytes_written);
        self.finished = true;
        StatusCode::Ok
    }

    fn reenable(&mut self) -> StatusCode {
        // Nothing to rewrite for file-backed images; just make sure the
        // system image is still in place.
        match self.manager() {
            Ok(manager) if manager.backing_image_exists(SYSTEM_IMAGE) => {
                self.finished = true;
                StatusCode::Ok
            }
            Ok(_) => {
                tracing::error!("system image is missing");
                StatusCode::GenericError
            }
            Err(e) => {
                tracing::error!("opening image manager: {e:#}");
                StatusCode::GenericError
            }
        }
    }

    fn wipe_userdata(&mut self) -> StatusCode {
        let r = (|| -> Result<()> {
            let mut manager = self.manager()?;
            let path = image_path(&self.params.install_dir, USERDATA_IMAGE);
            let size = std::fs::metadata(&path)
                .map(|m| m.len())
                .unwrap_or(self.userdata_size);
            if manager.backing_image_exists(USERDATA_IMAGE)
                && !manager.delete_backing_image(USERDATA_IMAGE)
            {
                bail!("could not remove userdata image");
            }
            manager.create_backing_image(USERDATA_IMAGE, size, 0)?;
            Ok(())
        })();
        match r {
            Ok(()) => StatusCode::Ok,
            Err(e) => {
                tracing::error!("wiping userdata: {e:#}");
                StatusCode::GenericError
            }
        }
    }

    fn userdata_size(&self) -> u64 {
        self.userdata_size
    }

    fn install_dir(&self) -> &Utf8Path {
        &self.params.install_dir
    }
}

impl Drop for FileInstaller {
    /// An abandoned session must not leave a partial system image
    /// behind.
    fn drop(&mut self) {
        if self.system.is_none() || self.finished {
            return;
        }
        self.system = None;
        match self.manager() {
            Ok(mut manager) => {
                if !manager.delete_backing_image(SYSTEM_IMAGE) {
                    tracing::warn!("could not remove partial system image");
                }
            }
            Err(e) => tracing::warn!("cleaning up partial install: {e:#}"),
        }
    }
}

/// [`Backend`] producing the file-backed reference implementations.
#[derive(Debug, Clone)]
pub struct FileBackend {
    metadata_root: Utf8PathBuf,
}

impl FileBackend {
    /// Back images with files, keeping per-install metadata directories
    /// under `metadata_root`.
    pub fn new(metadata_root: &Utf8Path) -> Self {
        Self {
            metadata_root: metadata_root.to_owned(),
        }
    }
}

impl Backend for FileBackend {
    fn open_image_manager(
        &self,
        metadata_dir: &Utf8Path,
        data_dir: &Utf8Path,
    ) -> Result<Box<dyn ImageManager>> {
        Ok(Box::new(FileImageManager::open(metadata_dir, data_dir)?))
    }

    fn installer(
        &self,
        params: InstallParams,
        hooks: InstallerHooks,
    ) -> Result<Box<dyn Installer>> {
        Ok(Box::new(FileInstaller::new(
            &self.metadata_root,
            params,
            hooks,
        )))
    }
}
