//! Caller-facing error and result types.

use camino::Utf8PathBuf;
use serde::Serialize;

/// Errors returned synchronously to callers and never retried
/// automatically. Read-only queries that hit storage faults do not
/// produce these; they degrade to a conservative default instead (see
/// the propagation notes on [`crate::service::Service`]).
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The caller is not in the allowed set for this operation.
    #[error("uid {uid} is not allowed")]
    PermissionDenied {
        /// The rejected identity, for diagnostics.
        uid: u32,
    },
    /// A path failed canonicalization or escaped its containment root.
    #[error("invalid path {0}")]
    InvalidPath(Utf8PathBuf),
    /// An external collaborator reported failure.
    #[error("{stage}: {source}")]
    Delegate {
        /// Which delegation seam failed.
        stage: &'static str,
        /// The collaborator's error.
        #[source]
        source: anyhow::Error,
    },
}

/// The small, stable result enum for install operations. System-level
/// clients see these as plain integers; anything more detailed goes to
/// the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[repr(i32)]
pub enum StatusCode {
    /// Success.
    Ok = 0,
    /// Catch-all failure: bad parameters, storage faults, delegate
    /// failures.
    GenericError = 1,
    /// Not enough free space for the requested image sizes.
    NoSpace = 2,
    /// The backing filesystem is too fragmented to allocate the images.
    FilesystemCluttered = 3,
}

impl StatusCode {
    /// Whether this is the success code.
    pub fn is_ok(self) -> bool {
        matches!(self, StatusCode::Ok)
    }

    /// The wire representation.
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}
