//! Caller identity checks.
//!
//! Stateless by design: the check runs before any lock is taken or any
//! side effect occurs, so a rejected caller cannot perturb the service.

use crate::error::ServiceError;

/// Root.
pub const ROOT_UID: u32 = 0;
/// The platform's system server.
pub const SYSTEM_UID: u32 = 1000;
/// The interactive shell; lower trust, query/teardown only.
pub const SHELL_UID: u32 = 2000;

/// Authority required for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessLevel {
    /// Identity-mutating operations: root or the system server only.
    System,
    /// Queries and teardown: additionally allows the shell.
    SystemOrShell,
}

/// Reject callers outside the allowed set for `level`.
pub fn check_uid(uid: u32, level: AccessLevel) -> Result<(), ServiceError> {
    let allowed = match level {
        AccessLevel::System => uid == ROOT_UID || uid == SYSTEM_UID,
        AccessLevel::SystemOrShell => {
            uid == ROOT_UID || uid == SYSTEM_UID || uid == SHELL_UID
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(ServiceError::PermissionDenied { uid })
    }
}
