//! Boot-eligibility policy over the status store.
//!
//! These functions are invoked by the code that decides, once per boot,
//! whether entering the installed image is permitted. An attempt counter
//! in the status slot bounds crash loops: it is incremented on every
//! eligible boot and only reset to `ok` once userspace confirms the boot
//! survived.

use anyhow::Result;
use serde::Serialize;

use crate::statestore::{InstallStatus, StatusStore};

/// Boot attempts allowed before an unconfirmed image is considered
/// failed and the device falls back to the original system.
pub const MAX_BOOT_ATTEMPTS: u32 = 3;

/// How the installed image will behave on the next boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootStatus {
    /// No image is installed.
    NotInstalled,
    /// The image and its userdata will be removed on the next boot.
    WillWipe,
    /// The image boots exactly once, then disables itself.
    SingleBoot,
    /// Installed, but booting into the image is suppressed.
    Disabled,
    /// The next boot enters the image.
    Enabled,
}

impl std::fmt::Display for BootStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NotInstalled => "not-installed",
            Self::WillWipe => "will-wipe",
            Self::SingleBoot => "single-boot",
            Self::Disabled => "disabled",
            Self::Enabled => "enabled",
        };
        f.write_str(s)
    }
}

/// Classify persisted state into a [`BootStatus`].
///
/// `Wipe` takes precedence over every other installed state. A
/// single-boot image reports itself `disabled` internally right after
/// its one boot, but callers still see `SingleBoot` while the flag is
/// present, which makes the transition clearer.
pub fn classify(installed: bool, status: Option<InstallStatus>, one_shot: bool) -> BootStatus {
    if !installed {
        return BootStatus::NotInstalled;
    }
    match status {
        Some(InstallStatus::Wipe) => BootStatus::WillWipe,
        Some(InstallStatus::Disabled) if one_shot => BootStatus::SingleBoot,
        Some(InstallStatus::Disabled) => BootStatus::Disabled,
        _ if one_shot => BootStatus::SingleBoot,
        _ => BootStatus::Enabled,
    }
}

/// Decide whether this boot may enter the installed image.
///
/// The booted indicator is always removed first, so that an aborted or
/// crashed boot falls back to the original system; it is re-created by
/// [`mark_system_as_gsi`] only once the image has actually taken over.
/// Every eligible boot of an unconfirmed image consumes one attempt
/// from the retry budget, persisted before we report eligibility.
///
/// Storage faults are never fatal to the boot sequence; they are logged
/// and reported as "not eligible".
pub fn can_boot_into_gsi(store: &StatusStore) -> bool {
    if let Err(e) = store.clear_booted_indicator() {
        tracing::error!("clearing booted indicator: {e:#}");
        return false;
    }

    if !store.is_installed() {
        tracing::debug!("no GSI detected");
        return false;
    }
    let status = match store.install_status() {
        Ok(Some(status)) => status,
        Ok(None) => return false,
        Err(e) => {
            tracing::error!("reading install status: {e:#}");
            return false;
        }
    };
    match status {
        InstallStatus::Attempted(n) => {
            if n + 1 >= MAX_BOOT_ATTEMPTS {
                tracing::error!("exceeded max boot attempts");
                return false;
            }
            if let Err(e) = store.set_install_status(InstallStatus::Attempted(n + 1)) {
                tracing::error!("recording boot attempt: {e:#}");
                return false;
            }
            true
        }
        InstallStatus::Ok => true,
        InstallStatus::Wipe | InstallStatus::Disabled => false,
    }
}

/// Record that the running environment is the GSI. Invoked by the code
/// path that actually enters the image, after [`can_boot_into_gsi`]
/// reported eligibility.
pub fn mark_system_as_gsi(store: &StatusStore) -> Result<()> {
    store.set_booted_indicator()
}

/// Confirm that the prior boot of the image succeeded: an outstanding
/// attempt counter is rewritten to `ok`, restoring the full retry
/// budget. Idempotent. Intentionally leaves the one-shot flag alone;
/// disabling a single-boot image happens during takeover, not here,
/// so the image is never disabled before it has finished taking over.
pub fn mark_boot_successful(store: &StatusStore) -> Result<()> {
    if let Some(InstallStatus::Attempted(_)) = store.install_status()? {
        store.set_install_status(InstallStatus::Ok)?;
    }
    Ok(())
}
