//! The service-facing orchestrator.
//!
//! Every state-mutating operation is serialized behind one lock, which
//! also guards the single install-session slot; the progress snapshot
//! lives behind a second, independent lock so polls never contend with
//! a long-running chunk commit. Cancellation is cooperative: the abort
//! flag is raised *before* the orchestration lock is acquired, so a
//! bulk operation already holding the lock observes it and backs out
//! instead of deadlocking against the cancel call.
//!
//! Persisted state is the single source of truth: queries re-read the
//! marker files on every call, and read paths degrade to conservative
//! defaults ("not installed", "not eligible") on storage faults rather
//! than failing, while mutations surface their errors and leave prior
//! state untouched.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::access::{check_uid, AccessLevel, ROOT_UID};
use crate::boot::{self, BootStatus};
use crate::error::{ServiceError, StatusCode};
use crate::fstab::Fstab;
use crate::image::{Backend, ImageService};
use crate::install::{
    validate_install_params, InstallParams, InstallSession, InstallerHooks,
};
use crate::paths::{Paths, SYSTEM_IMAGE, USERDATA_IMAGE};
use crate::progress::{Progress, ProgressUpdater};
use crate::statestore::{InstallStatus, StatusStore};

/// How long a userdata size query waits for the image to map.
const MAP_TIMEOUT: Duration = Duration::from_secs(10);

struct State {
    session: Option<InstallSession>,
}

/// Process-wide service handle. Constructed once at startup and shared
/// by reference (`Arc`) with every request handler; shutdown is the
/// embedder's decision, there is no hidden singleton lifetime.
pub struct Service {
    paths: Paths,
    store: StatusStore,
    backend: Box<dyn Backend>,
    fstab: Box<dyn Fstab>,
    /// Orchestration lock: the session slot and every mutating
    /// operation.
    state: Mutex<State>,
    /// Progress snapshot, behind its own lock by design.
    progress: ProgressUpdater,
    /// Cooperative abort flag; see [`Self::cancel_install`].
    abort: Arc<AtomicBool>,
}

impl Service {
    /// Open the service over `paths`. Residual artifacts of an
    /// interrupted installation are cleaned up before the first
    /// operation runs.
    pub fn new(paths: Paths, backend: Box<dyn Backend>, fstab: Box<dyn Fstab>) -> Result<Self> {
        let store = StatusStore::open(&paths.metadata_dir)?;
        let service = Self {
            paths,
            store,
            backend,
            fstab,
            state: Mutex::new(State { session: None }),
            progress: ProgressUpdater::default(),
            abort: Arc::new(AtomicBool::new(false)),
        };
        service.cleanup_leftover_install();
        Ok(service)
    }

    /// The layout this service operates on.
    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Where installs live: the recorded directory, or the default when
    /// nothing is recorded.
    fn image_dir(&self) -> Utf8PathBuf {
        self.store
            .installed_image_dir()
            .unwrap_or_else(|| self.paths.default_image_dir.clone())
    }

    /// Sessions do not survive the process, so at startup any backing
    /// image present without an install marker is debris from an
    /// interrupted session.
    fn cleanup_leftover_install(&self) {
        if self.store.is_installed() {
            return;
        }
        let dir = self.image_dir();
        match self
            .backend
            .open_image_manager(&self.paths.image_metadata_root, &dir)
        {
            Ok(mut manager) => {
                for name in [SYSTEM_IMAGE, USERDATA_IMAGE] {
                    if manager.backing_image_exists(name) && !manager.delete_backing_image(name) {
                        tracing::warn!("could not remove leftover image {name}");
                    }
                }
            }
            Err(e) => tracing::debug!("no image manager for startup cleanup: {e:#}"),
        }
    }

    /// Start a new installation, silently superseding any session
    /// already in flight (a crashed client must never leave the service
    /// stuck). Returns the installer's status code; no session is
    /// retained unless it is `Ok`.
    pub fn begin_install(
        &self,
        uid: u32,
        params: InstallParams,
    ) -> Result<StatusCode, ServiceError> {
        check_uid(uid, AccessLevel::System)?;
        let mut state = self.lock_state();

        // Make sure any interrupted installation is cleaned up.
        state.session = None;

        let mut params = params;
        let status = validate_install_params(&mut params, &self.paths, self.fstab.as_ref());
        if !status.is_ok() {
            return Ok(status);
        }

        let hooks = InstallerHooks {
            progress: self.progress.clone(),
            abort: Arc::clone(&self.abort),
        };
        let installer = match self.backend.installer(params, hooks) {
            Ok(installer) => installer,
            Err(e) => {
                tracing::error!("constructing installer: {e:#}");
                return Ok(StatusCode::GenericError);
            }
        };
        let mut session = InstallSession::new(installer);
        let status = session.start();
        if status.is_ok() {
            state.session = Some(session);
        }
        Ok(status)
    }

    /// Forward one payload chunk from a stream to the active session.
    /// Not accepted (false) when no session exists.
    pub fn commit_chunk_from_stream(
        &self,
        uid: u32,
        stream: &mut dyn Read,
        len: u64,
    ) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::System)?;
        let mut state = self.lock_state();
        let Some(session) = state.session.as_mut() else {
            return Ok(false);
        };
        Ok(session.commit_chunk(stream, len))
    }

    /// Forward one in-memory payload chunk to the active session.
    pub fn commit_chunk(&self, uid: u32, data: &[u8]) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::System)?;
        let mut state = self.lock_state();
        let Some(session) = state.session.as_mut() else {
            return Ok(false);
        };
        Ok(session.commit_chunk_bytes(data))
    }

    /// Snapshot the current install progress. Takes only the progress
    /// lock: a poll never blocks on (or blocks) a chunk commit holding
    /// the orchestration lock, at the price of possibly observing a
    /// slightly stale (but never torn) snapshot.
    pub fn get_progress(&self, uid: u32) -> Result<Progress, ServiceError> {
        check_uid(uid, AccessLevel::System)?;
        Ok(self.progress.snapshot())
    }

    /// Commit the active session, making the install bootable; or, when
    /// no session exists, re-enable a previously disabled install.
    /// Either way the session slot is empty afterwards.
    pub fn set_bootable(&self, uid: u32, one_shot: bool) -> Result<StatusCode, ServiceError> {
        let mut state = self.lock_state();

        let status = match state.session.as_mut() {
            Some(session) => {
                check_uid(uid, AccessLevel::System)?;
                session.set_bootable(one_shot, &self.store)
            }
            None => {
                check_uid(uid, AccessLevel::SystemOrShell)?;
                self.reenable_locked(one_shot)
            }
        };
        state.session = None;
        Ok(status)
    }

    /// Re-enable a disabled install by reconstructing a session bound
    /// to the installed directory. Sizes are not re-validated on this
    /// path; the previously validated install is trusted.
    fn reenable_locked(&self, one_shot: bool) -> StatusCode {
        if !self.store.is_installed() {
            tracing::error!("no GSI installed - cannot re-enable");
            return StatusCode::GenericError;
        }
        match self.store.install_status() {
            Ok(Some(InstallStatus::Disabled)) => {}
            Ok(_) => {
                tracing::error!("GSI is not currently disabled");
                return StatusCode::GenericError;
            }
            Err(e) => {
                tracing::error!("reading install status: {e:#}");
                return StatusCode::GenericError;
            }
        }
        let mut session = match self.session_for_installed_dir() {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("constructing installer: {e:#}");
                return StatusCode::GenericError;
            }
        };
        session.reenable(one_shot, &self.store)
    }

    /// A session bound to the already-installed directory, for the
    /// re-enable and userdata-wipe paths.
    fn session_for_installed_dir(&self) -> Result<InstallSession> {
        let params = InstallParams {
            gsi_size: 0,
            userdata_size: 0,
            wipe_userdata: false,
            install_dir: self.image_dir(),
        };
        let hooks = InstallerHooks {
            progress: self.progress.clone(),
            abort: Arc::clone(&self.abort),
        };
        let installer = self.backend.installer(params, hooks)?;
        Ok(InstallSession::new(installer))
    }

    /// Whether the installed image boots on the next attempt without
    /// consuming retry budget.
    pub fn is_gsi_enabled(&self, uid: u32) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::SystemOrShell)?;
        let _state = self.lock_state();
        Ok(matches!(
            self.store.install_status(),
            Ok(Some(InstallStatus::Ok))
        ))
    }

    /// Whether an image is installed.
    pub fn is_gsi_installed(&self, uid: u32) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::SystemOrShell)?;
        let _state = self.lock_state();
        Ok(self.store.is_installed())
    }

    /// Whether the currently running system is the GSI.
    pub fn is_gsi_running(&self, uid: u32) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::SystemOrShell)?;
        let _state = self.lock_state();
        Ok(self.store.is_booted_into_gsi())
    }

    /// Whether an install session is active.
    pub fn is_install_in_progress(&self, uid: u32) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::SystemOrShell)?;
        let state = self.lock_state();
        Ok(state.session.is_some())
    }

    /// Cancel any in-flight installation. The abort flag is raised
    /// before the orchestration lock is acquired so a chunk commit
    /// already holding the lock observes the flag instead of
    /// deadlocking against this call; it is cleared once the lock is
    /// ours and the session is gone.
    pub fn cancel_install(&self, uid: u32) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::System)?;
        self.abort.store(true, Ordering::SeqCst);
        let mut state = self.lock_state();
        self.abort.store(false, Ordering::SeqCst);
        state.session = None;
        Ok(true)
    }

    /// Classify the current persisted state. `NotInstalled`
    /// short-circuits before any file read that could fail; unreadable
    /// status degrades to `NotInstalled` as well.
    pub fn gsi_boot_status(&self, uid: u32) -> Result<BootStatus, ServiceError> {
        check_uid(uid, AccessLevel::SystemOrShell)?;
        let _state = self.lock_state();

        if !self.store.is_installed() {
            return Ok(BootStatus::NotInstalled);
        }
        let status = match self.store.install_status() {
            Ok(Some(status)) => status,
            Ok(None) => return Ok(BootStatus::NotInstalled),
            Err(e) => {
                tracing::error!("reading install status: {e:#}");
                return Ok(BootStatus::NotInstalled);
            }
        };
        Ok(boot::classify(
            true,
            Some(status),
            self.store.one_shot_boot(),
        ))
    }

    /// Remove the install. While the image is the running system only a
    /// pending wipe can be recorded (its backing files cannot be
    /// deleted out from under it); otherwise the backing images and all
    /// markers are deleted outright, userdata always included.
    pub fn remove_install(&self, uid: u32) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::SystemOrShell)?;
        let state = self.lock_state();

        // In case an install was left hanging, prefer its directory.
        let install_dir = state
            .session
            .as_ref()
            .map(|s| s.install_dir().to_owned())
            .unwrap_or_else(|| self.image_dir());

        if self.store.is_booted_into_gsi() {
            Ok(self.record_pending_wipe())
        } else {
            Ok(self.remove_gsi_files(&install_dir, true))
        }
    }

    fn record_pending_wipe(&self) -> bool {
        match self.store.set_install_status(InstallStatus::Wipe) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("recording pending wipe: {e:#}");
                false
            }
        }
    }

    /// Delete backing images and install markers.
    fn remove_gsi_files(&self, install_dir: &Utf8Path, wipe_userdata: bool) -> bool {
        let mut ok = true;
        match self
            .backend
            .open_image_manager(&self.paths.image_metadata_root, install_dir)
        {
            Ok(mut manager) => {
                ok &= manager.delete_backing_image(SYSTEM_IMAGE);
                if wipe_userdata {
                    ok &= manager.delete_backing_image(USERDATA_IMAGE);
                }
            }
            Err(e) => tracing::debug!("no image manager for {install_dir}: {e:#}"),
        }
        ok &= self.store.remove_install_markers();
        ok
    }

    /// Suppress booting into the installed image. Rejected while an
    /// installation is active.
    pub fn disable_install(&self, uid: u32) -> Result<bool, ServiceError> {
        check_uid(uid, AccessLevel::SystemOrShell)?;
        let state = self.lock_state();

        if !self.store.is_installed() {
            tracing::error!("cannot disable: no install detected");
            return Ok(false);
        }
        if state.session.is_some() {
            tracing::error!("cannot disable during an installation");
            return Ok(false);
        }
        match self.store.set_install_status(InstallStatus::Disabled) {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::error!("writing install status: {e:#}");
                Ok(false)
            }
        }
    }

    /// Size of the userdata image in bytes, or -1 when it cannot be
    /// determined (which is not an error). Three sources, in priority
    /// order: the active session's computed size, the live block device
    /// while the image is running, or a bounded-timeout mapping of the
    /// backing image.
    pub fn userdata_image_size(&self, uid: u32) -> Result<i64, ServiceError> {
        check_uid(uid, AccessLevel::System)?;
        let state = self.lock_state();

        if let Some(session) = state.session.as_ref() {
            // Already computed during session construction.
            return Ok(session.userdata_size() as i64);
        }
        if self.store.is_booted_into_gsi() {
            return Ok(
                block_device_size(&self.paths.userdata_block_device).unwrap_or_else(|e| {
                    tracing::error!("sizing {}: {e:#}", self.paths.userdata_block_device);
                    -1
                }),
            );
        }

        let dir = self.image_dir();
        let mut manager = match self
            .backend
            .open_image_manager(&self.paths.image_metadata_root, &dir)
        {
            Ok(manager) => manager,
            Err(e) => {
                tracing::error!("opening image manager: {e:#}");
                return Ok(-1);
            }
        };
        let device = match manager.map_image_device(USERDATA_IMAGE, MAP_TIMEOUT) {
            Ok(device) => device,
            Err(e) => {
                tracing::error!("mapping {USERDATA_IMAGE}: {e:#}");
                return Ok(-1);
            }
        };
        let size = block_device_size(&device).unwrap_or_else(|e| {
            tracing::error!("sizing {device}: {e:#}");
            -1
        });
        if !manager.unmap_image_device(USERDATA_IMAGE) {
            tracing::warn!("could not unmap {USERDATA_IMAGE}");
        }
        Ok(size)
    }

    /// Directory holding the backing images, when an install exists.
    pub fn installed_image_dir(&self, uid: u32) -> Result<Option<Utf8PathBuf>, ServiceError> {
        check_uid(uid, AccessLevel::System)?;
        let _state = self.lock_state();
        if !self.store.is_installed() {
            return Ok(None);
        }
        Ok(Some(self.image_dir()))
    }

    /// Destroy and recreate the userdata image of an existing install.
    pub fn wipe_gsi_userdata(&self, uid: u32) -> Result<StatusCode, ServiceError> {
        check_uid(uid, AccessLevel::SystemOrShell)?;
        let _state = self.lock_state();

        if self.store.is_booted_into_gsi() || !self.store.is_installed() {
            return Ok(StatusCode::GenericError);
        }
        let mut session = match self.session_for_installed_dir() {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("constructing installer: {e:#}");
                return Ok(StatusCode::GenericError);
            }
        };
        Ok(session.wipe_userdata())
    }

    /// Hand out a scoped image service for `prefix`, restricted to the
    /// highest-trust identity and gated to it thereafter. Both derived
    /// paths must canonicalize to somewhere under the fixed roots.
    pub fn open_image_service(&self, uid: u32, prefix: &str) -> Result<ImageService, ServiceError> {
        if uid != ROOT_UID {
            return Err(ServiceError::PermissionDenied { uid });
        }
        let metadata_dir = contained_path(&self.paths.image_metadata_root, prefix)?;
        let data_dir = contained_path(&self.paths.default_image_parent, prefix)?;
        let manager = self
            .backend
            .open_image_manager(&metadata_dir, &data_dir)
            .map_err(|e| ServiceError::Delegate {
                stage: "open image manager",
                source: e,
            })?;
        Ok(ImageService::new(manager, uid))
    }

    /// One-time reconciliation at process start: confirm a successful
    /// boot of the image, or execute a wipe that was requested outside
    /// the normal boot path (e.g. from a bootloader-level reset tool).
    /// Failures are logged and treated as "no action"; startup never
    /// blocks on a corrupt marker.
    pub fn run_startup_tasks(&self) {
        let _state = self.lock_state();

        if !self.store.is_installed() {
            return;
        }
        let status = match self.store.install_status() {
            Ok(Some(status)) => status,
            Ok(None) => return,
            Err(e) => {
                tracing::error!("reading install status: {e:#}");
                return;
            }
        };

        if !self.store.is_booted_into_gsi() {
            if status == InstallStatus::Wipe {
                if !self.remove_gsi_files(&self.image_dir(), true) {
                    tracing::warn!("pending wipe did not complete cleanly");
                }
            }
        } else if matches!(status, InstallStatus::Attempted(_)) {
            // A single-boot image has already rewritten its status to
            // "disabled" by this point, so only an outstanding attempt
            // counter gets confirmed here.
            if let Err(e) = boot::mark_boot_successful(&self.store) {
                tracing::error!("marking boot successful: {e:#}");
            }
        }
    }
}

/// `root/prefix`, canonicalized, rejecting anything that escapes
/// `root`.
fn contained_path(root: &Utf8Path, prefix: &str) -> Result<Utf8PathBuf, ServiceError> {
    let joined = root.join(prefix);
    let canonical = joined
        .canonicalize_utf8()
        .map_err(|_| ServiceError::InvalidPath(joined.clone()))?;
    if !canonical.starts_with(root) {
        return Err(ServiceError::InvalidPath(joined));
    }
    Ok(canonical)
}

/// Size in bytes of a block device (or regular file), by seeking to the
/// end.
fn block_device_size(path: &Utf8Path) -> Result<i64> {
    use std::io::{Seek, SeekFrom};
    let mut f = std::fs::File::open(path).with_context(|| format!("opening {path}"))?;
    let size = f.seek(SeekFrom::End(0)).context("seeking to end")?;
    Ok(size as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Instant;

    use anyhow::bail;

    use crate::access::{SHELL_UID, SYSTEM_UID};
    use crate::backend::FileBackend;
    use crate::image::ImageManager;
    use crate::install::Installer;
    use crate::paths::SECTOR_SIZE;
    use crate::progress::ProgressStatus;

    struct NoVerity;
    impl Fstab for NoVerity {
        fn verity_check_at_most_once(&self, _mount_point: &str) -> Result<bool> {
            Ok(false)
        }
    }

    struct Fixture {
        _td: tempfile::TempDir,
        paths: Paths,
        service: Service,
    }

    fn fixture_with_backend(backend: Box<dyn Backend>) -> Fixture {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().canonicalize().unwrap()).unwrap();
        let paths = Paths::under(&root);
        std::fs::create_dir_all(&paths.default_image_dir).unwrap();
        let service = Service::new(paths.clone(), backend, Box::new(NoVerity)).unwrap();
        Fixture {
            _td: td,
            paths,
            service,
        }
    }

    fn fixture() -> Fixture {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().canonicalize().unwrap()).unwrap();
        let paths = Paths::under(&root);
        std::fs::create_dir_all(&paths.default_image_dir).unwrap();
        let backend = Box::new(FileBackend::new(&paths.image_metadata_root));
        let service = Service::new(paths.clone(), backend, Box::new(NoVerity)).unwrap();
        Fixture {
            _td: td,
            paths,
            service,
        }
    }

    fn default_params(paths: &Paths, gsi_size: u64) -> InstallParams {
        InstallParams {
            gsi_size,
            userdata_size: SECTOR_SIZE * 8,
            wipe_userdata: false,
            install_dir: paths.default_image_dir.clone(),
        }
    }

    /// Run a full install and make it bootable.
    fn install(f: &Fixture, gsi_size: u64, one_shot: bool) {
        let params = default_params(&f.paths, gsi_size);
        assert!(f
            .service
            .begin_install(SYSTEM_UID, params)
            .unwrap()
            .is_ok());
        let payload = vec![0x5au8; gsi_size as usize];
        let mut stream = Cursor::new(payload);
        assert!(f
            .service
            .commit_chunk_from_stream(SYSTEM_UID, &mut stream, gsi_size)
            .unwrap());
        assert!(f.service.set_bootable(SYSTEM_UID, one_shot).unwrap().is_ok());
    }

    fn store(f: &Fixture) -> StatusStore {
        StatusStore::open(&f.paths.metadata_dir).unwrap()
    }

    #[test]
    fn test_fresh_device_install_flow() {
        let f = fixture();
        assert!(!f.service.is_gsi_installed(SHELL_UID).unwrap());
        assert_eq!(
            f.service.gsi_boot_status(SHELL_UID).unwrap(),
            BootStatus::NotInstalled
        );

        let size = SECTOR_SIZE * 100;
        assert!(f
            .service
            .begin_install(SYSTEM_UID, default_params(&f.paths, size))
            .unwrap()
            .is_ok());
        assert!(f.service.is_install_in_progress(SHELL_UID).unwrap());

        let payload = vec![0xa5u8; size as usize];
        assert!(f.service.commit_chunk(SYSTEM_UID, &payload).unwrap());
        assert!(f.service.set_bootable(SYSTEM_UID, false).unwrap().is_ok());

        assert!(!f.service.is_install_in_progress(SHELL_UID).unwrap());
        assert!(f.service.is_gsi_installed(SHELL_UID).unwrap());
        // The attempt counter starts at zero; the install is enabled
        // for boot but not yet confirmed good.
        assert_eq!(
            store(&f).install_status().unwrap(),
            Some(InstallStatus::Attempted(0))
        );
        assert!(!f.service.is_gsi_enabled(SHELL_UID).unwrap());
        assert_eq!(
            f.service.gsi_boot_status(SHELL_UID).unwrap(),
            BootStatus::Enabled
        );
        assert_eq!(
            f.service.installed_image_dir(SYSTEM_UID).unwrap(),
            Some(f.paths.default_image_dir.clone())
        );
    }

    #[test]
    fn test_second_begin_supersedes_first() {
        let f = fixture();
        let size = SECTOR_SIZE * 8;
        assert!(f
            .service
            .begin_install(SYSTEM_UID, default_params(&f.paths, size))
            .unwrap()
            .is_ok());
        assert!(f
            .service
            .commit_chunk(SYSTEM_UID, &vec![0u8; (size / 2) as usize])
            .unwrap());

        // The second call silently supersedes the half-finished first.
        assert!(f
            .service
            .begin_install(SYSTEM_UID, default_params(&f.paths, size))
            .unwrap()
            .is_ok());
        assert!(f.service.is_install_in_progress(SHELL_UID).unwrap());

        // The new session accepts the full payload from byte zero.
        assert!(f
            .service
            .commit_chunk(SYSTEM_UID, &vec![0u8; size as usize])
            .unwrap());
        assert!(f.service.set_bootable(SYSTEM_UID, false).unwrap().is_ok());
    }

    #[test]
    fn test_failed_start_leaves_no_session() {
        let f = fixture_with_backend(Box::new(StubBackend {
            start_status: StatusCode::GenericError,
            commit_delay: Duration::ZERO,
        }));
        let status = f
            .service
            .begin_install(SYSTEM_UID, default_params(&f.paths, SECTOR_SIZE))
            .unwrap();
        assert_eq!(status, StatusCode::GenericError);
        assert!(!f.service.is_install_in_progress(SHELL_UID).unwrap());
    }

    #[test]
    fn test_validation_failure_creates_nothing() {
        let f = fixture();
        let status = f
            .service
            .begin_install(SYSTEM_UID, default_params(&f.paths, SECTOR_SIZE - 1))
            .unwrap();
        assert_eq!(status, StatusCode::GenericError);
        assert!(!f.service.is_install_in_progress(SHELL_UID).unwrap());
        assert!(!f.service.is_gsi_installed(SHELL_UID).unwrap());
    }

    #[test]
    fn test_cancel_install() {
        let f = fixture();
        let size = SECTOR_SIZE * 8;
        assert!(f
            .service
            .begin_install(SYSTEM_UID, default_params(&f.paths, size))
            .unwrap()
            .is_ok());
        assert!(f.service.cancel_install(SYSTEM_UID).unwrap());
        assert!(!f.service.is_install_in_progress(SHELL_UID).unwrap());
        assert!(!f.service.commit_chunk(SYSTEM_UID, &[0u8; 16]).unwrap());
    }

    #[test]
    fn test_disable_and_reenable() {
        let f = fixture();
        install(&f, SECTOR_SIZE * 4, false);

        assert!(f.service.disable_install(SHELL_UID).unwrap());
        assert_eq!(
            f.service.gsi_boot_status(SHELL_UID).unwrap(),
            BootStatus::Disabled
        );

        // Re-enable without an active session goes through the
        // restricted-authority path.
        assert!(f.service.set_bootable(SHELL_UID, false).unwrap().is_ok());
        assert_eq!(
            f.service.gsi_boot_status(SHELL_UID).unwrap(),
            BootStatus::Enabled
        );

        // Re-enabling an install that is not disabled is rejected.
        assert_eq!(
            f.service.set_bootable(SHELL_UID, false).unwrap(),
            StatusCode::GenericError
        );
    }

    #[test]
    fn test_disable_requires_install() {
        let f = fixture();
        assert!(!f.service.disable_install(SHELL_UID).unwrap());
    }

    #[test]
    fn test_disable_rejected_during_install() {
        let f = fixture();
        install(&f, SECTOR_SIZE * 4, false);
        // A new session over the existing install blocks disabling.
        assert!(f
            .service
            .begin_install(SYSTEM_UID, default_params(&f.paths, SECTOR_SIZE * 4))
            .unwrap()
            .is_ok());
        assert!(!f.service.disable_install(SHELL_UID).unwrap());
    }

    #[test]
    fn test_single_boot_reports_after_self_disable() {
        let f = fixture();
        install(&f, SECTOR_SIZE * 4, true);
        assert_eq!(
            f.service.gsi_boot_status(SHELL_UID).unwrap(),
            BootStatus::SingleBoot
        );

        // The image disables itself right after its one boot; callers
        // still see the single-boot framing.
        store(&f)
            .set_install_status(InstallStatus::Disabled)
            .unwrap();
        assert_eq!(
            f.service.gsi_boot_status(SHELL_UID).unwrap(),
            BootStatus::SingleBoot
        );
    }

    #[test]
    fn test_remove_install_offline() {
        let f = fixture();
        install(&f, SECTOR_SIZE * 4, false);
        assert!(f.service.remove_install(SHELL_UID).unwrap());
        assert!(!f.service.is_gsi_installed(SHELL_UID).unwrap());
        assert_eq!(
            f.service.gsi_boot_status(SHELL_UID).unwrap(),
            BootStatus::NotInstalled
        );
        assert!(!f
            .paths
            .default_image_dir
            .join("system_gsi.img")
            .exists());
        assert!(!f
            .paths
            .default_image_dir
            .join("userdata_gsi.img")
            .exists());
    }

    #[test]
    fn test_remove_while_running_records_wipe() {
        let f = fixture();
        install(&f, SECTOR_SIZE * 4, false);
        store(&f).set_booted_indicator().unwrap();

        assert!(f.service.remove_install(SHELL_UID).unwrap());
        // Files survive; only the pending wipe is recorded.
        assert!(f.paths.default_image_dir.join("system_gsi.img").exists());
        assert_eq!(
            store(&f).install_status().unwrap(),
            Some(InstallStatus::Wipe)
        );
        assert_eq!(
            f.service.gsi_boot_status(SHELL_UID).unwrap(),
            BootStatus::WillWipe
        );
    }

    #[test]
    fn test_startup_executes_pending_wipe() {
        let f = fixture();
        install(&f, SECTOR_SIZE * 4, false);
        store(&f).set_install_status(InstallStatus::Wipe).unwrap();

        f.service.run_startup_tasks();
        assert!(!f.service.is_gsi_installed(SHELL_UID).unwrap());
        assert!(!f
            .paths
            .default_image_dir
            .join("system_gsi.img")
            .exists());
    }

    #[test]
    fn test_startup_confirms_successful_boot() {
        let f = fixture();
        install(&f, SECTOR_SIZE * 4, false);
        let s = store(&f);
        s.set_install_status(InstallStatus::Attempted(1)).unwrap();
        s.set_booted_indicator().unwrap();

        f.service.run_startup_tasks();
        assert_eq!(s.install_status().unwrap(), Some(InstallStatus::Ok));
        assert!(f.service.is_gsi_enabled(SHELL_UID).unwrap());

        // A self-disabled single-boot image is not resurrected.
        s.set_install_status(InstallStatus::Disabled).unwrap();
        f.service.run_startup_tasks();
        assert_eq!(s.install_status().unwrap(), Some(InstallStatus::Disabled));
    }

    #[test]
    fn test_userdata_image_size_sources() {
        let f = fixture();
        // Nothing installed, no session: unknown.
        assert_eq!(f.service.userdata_image_size(SYSTEM_UID).unwrap(), -1);

        let size = SECTOR_SIZE * 4;
        assert!(f
            .service
            .begin_install(SYSTEM_UID, default_params(&f.paths, size))
            .unwrap()
            .is_ok());
        // Active session: the computed size.
        assert_eq!(
            f.service.userdata_image_size(SYSTEM_UID).unwrap(),
            (SECTOR_SIZE * 8) as i64
        );

        let payload = vec![0u8; size as usize];
        assert!(f.service.commit_chunk(SYSTEM_UID, &payload).unwrap());
        assert!(f.service.set_bootable(SYSTEM_UID, false).unwrap().is_ok());

        // No session: measured by mapping the backing image.
        assert_eq!(
            f.service.userdata_image_size(SYSTEM_UID).unwrap(),
            (SECTOR_SIZE * 8) as i64
        );
    }

    #[test]
    fn test_wipe_userdata() {
        let f = fixture();
        install(&f, SECTOR_SIZE * 4, false);

        let userdata = f.paths.default_image_dir.join("userdata_gsi.img");
        std::fs::write(&userdata, b"dirty").unwrap();
        assert!(f.service.wipe_gsi_userdata(SHELL_UID).unwrap().is_ok());
        let metadata = std::fs::metadata(&userdata).unwrap();
        assert_eq!(metadata.len(), 5);
        assert_ne!(std::fs::read(&userdata).unwrap(), b"dirty");

        // Rejected while the image is running.
        store(&f).set_booted_indicator().unwrap();
        assert!(!f.service.wipe_gsi_userdata(SHELL_UID).unwrap().is_ok());
    }

    #[test]
    fn test_permission_checks() {
        let f = fixture();
        assert!(matches!(
            f.service
                .begin_install(SHELL_UID, default_params(&f.paths, SECTOR_SIZE))
                .unwrap_err(),
            ServiceError::PermissionDenied { uid: SHELL_UID }
        ));
        assert!(f.service.get_progress(SHELL_UID).is_err());
        assert!(f.service.userdata_image_size(SHELL_UID).is_err());
        assert!(f.service.installed_image_dir(SHELL_UID).is_err());
        assert!(f.service.cancel_install(SHELL_UID).is_err());
        assert!(f.service.is_gsi_installed(4321).is_err());
        assert!(f.service.open_image_service(SYSTEM_UID, "dsu").is_err());
    }

    #[test]
    fn test_open_image_service() {
        let f = fixture();
        // The containment roots must exist for canonicalization.
        std::fs::create_dir_all(f.paths.image_metadata_root.join("dsu")).unwrap();

        let svc = f.service.open_image_service(ROOT_UID, "dsu").unwrap();
        svc.create_backing_image(ROOT_UID, "scratch", 4096, 0)
            .unwrap();
        assert!(svc.backing_image_exists(ROOT_UID, "scratch").unwrap());
        let device = svc
            .map_image_device(ROOT_UID, "scratch", Duration::from_secs(1))
            .unwrap();
        assert!(device.exists());
        assert!(svc.is_image_mapped(ROOT_UID, "scratch").unwrap());
        assert!(svc.unmap_image_device(ROOT_UID, "scratch").unwrap());
        assert!(svc.delete_backing_image(ROOT_UID, "scratch").unwrap());

        // The handle is gated to the identity it was created for.
        assert!(matches!(
            svc.backing_image_exists(SYSTEM_UID, "scratch").unwrap_err(),
            ServiceError::PermissionDenied { uid: SYSTEM_UID }
        ));

        // Escaping the containment roots is rejected.
        assert!(matches!(
            f.service.open_image_service(ROOT_UID, "../.."),
            Err(ServiceError::InvalidPath(_))
        ));
    }

    #[test]
    fn test_startup_cleanup_removes_leftover_images() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(td.path().canonicalize().unwrap()).unwrap();
        let paths = Paths::under(&root);
        std::fs::create_dir_all(&paths.default_image_dir).unwrap();
        // Debris from an interrupted session, with no install markers.
        let leftover = paths.default_image_dir.join("system_gsi.img");
        std::fs::write(&leftover, b"partial").unwrap();

        let backend = Box::new(FileBackend::new(&paths.image_metadata_root));
        let _service = Service::new(paths.clone(), backend, Box::new(NoVerity)).unwrap();
        assert!(!leftover.exists());
    }

    struct StubInstaller {
        install_dir: Utf8PathBuf,
        progress: ProgressUpdater,
        commit_delay: Duration,
        start_status: StatusCode,
    }

    impl Installer for StubInstaller {
        fn start(&mut self) -> StatusCode {
            self.start_status
        }
        fn commit_chunk(&mut self, _stream: &mut dyn Read, _len: u64) -> bool {
            self.progress.start_async_operation("write_system", 100);
            self.progress.update(ProgressStatus::Working, 50);
            std::thread::sleep(self.commit_delay);
            self.progress.update(ProgressStatus::Complete, 100);
            true
        }
        fn commit_chunk_bytes(&mut self, data: &[u8]) -> bool {
            let mut cursor = data;
            self.commit_chunk(&mut cursor, data.len() as u64)
        }
        fn finalize_images(&mut self) -> StatusCode {
            StatusCode::Ok
        }
        fn reenable(&mut self) -> StatusCode {
            StatusCode::Ok
        }
        fn wipe_userdata(&mut self) -> StatusCode {
            StatusCode::Ok
        }
        fn userdata_size(&self) -> u64 {
            0
        }
        fn install_dir(&self) -> &Utf8Path {
            &self.install_dir
        }
    }

    struct StubBackend {
        start_status: StatusCode,
        commit_delay: Duration,
    }

    impl Backend for StubBackend {
        fn open_image_manager(
            &self,
            _metadata_dir: &Utf8Path,
            _data_dir: &Utf8Path,
        ) -> Result<Box<dyn ImageManager>> {
            bail!("stub backend has no image manager")
        }
        fn installer(
            &self,
            params: InstallParams,
            hooks: InstallerHooks,
        ) -> Result<Box<dyn Installer>> {
            Ok(Box::new(StubInstaller {
                install_dir: params.install_dir,
                progress: hooks.progress,
                commit_delay: self.commit_delay,
                start_status: self.start_status,
            }))
        }
    }

    #[test]
    fn test_progress_poll_does_not_block_on_commit() {
        let commit_delay = Duration::from_millis(1500);
        let f = fixture_with_backend(Box::new(StubBackend {
            start_status: StatusCode::Ok,
            commit_delay,
        }));
        let paths = f.paths.clone();
        let service = Arc::new(f.service);
        assert!(service
            .begin_install(SYSTEM_UID, default_params(&paths, SECTOR_SIZE * 4))
            .unwrap()
            .is_ok());

        let committer = {
            let service = Arc::clone(&service);
            std::thread::spawn(move || service.commit_chunk(SYSTEM_UID, &[0u8; 16]).unwrap())
        };
        // Wait until the commit has taken the orchestration lock and
        // published its first progress update.
        let deadline = Instant::now() + commit_delay;
        while service.get_progress(SYSTEM_UID).unwrap().total_bytes != 100 {
            assert!(Instant::now() < deadline, "commit never started");
            std::thread::sleep(Duration::from_millis(10));
        }

        let polled = Instant::now();
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let service = Arc::clone(&service);
                std::thread::spawn(move || service.get_progress(SYSTEM_UID).unwrap())
            })
            .collect();
        for reader in readers {
            let p = reader.join().unwrap();
            // Never torn: whatever pair of fields we catch is
            // internally consistent.
            assert_eq!(p.total_bytes, 100);
            assert!(p.bytes_processed <= p.total_bytes);
        }
        // The commit is still asleep holding the orchestration lock;
        // the polls must not have waited for it.
        assert!(
            polled.elapsed() < commit_delay / 2,
            "progress polls blocked on the in-flight commit"
        );
        assert!(committer.join().unwrap());
    }
}
