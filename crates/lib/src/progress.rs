//! Install progress reporting.
//!
//! The snapshot lives behind its own mutex, deliberately separate from
//! the orchestration lock, so a concurrent progress poll never contends
//! with a long-running chunk commit.

use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Coarse state of the reported operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressStatus {
    /// Nothing is running.
    #[default]
    NoOperation,
    /// The step is underway.
    Working,
    /// The step finished.
    Complete,
}

/// Snapshot of the current long-running step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Progress {
    /// Name of the step, e.g. `allocate_userdata`.
    pub step: String,
    /// Whether the step is still running.
    pub status: ProgressStatus,
    /// Bytes handled so far.
    pub bytes_processed: u64,
    /// Total bytes the step will handle.
    pub total_bytes: u64,
}

/// Shared handle through which installers publish progress and callers
/// poll it. Clones share one snapshot.
#[derive(Debug, Clone, Default)]
pub struct ProgressUpdater(Arc<Mutex<Progress>>);

impl ProgressUpdater {
    /// Begin reporting a new step of `total_bytes`.
    pub fn start_async_operation(&self, step: &str, total_bytes: u64) {
        let mut p = self.0.lock().unwrap();
        p.step = step.to_owned();
        p.status = ProgressStatus::Working;
        p.bytes_processed = 0;
        p.total_bytes = total_bytes;
    }

    /// Update the byte count for the current step. `Complete` forces the
    /// count to the total, so block rounding can never make the final
    /// report under-shoot.
    pub fn update(&self, status: ProgressStatus, bytes_processed: u64) {
        let mut p = self.0.lock().unwrap();
        p.status = status;
        p.bytes_processed = if status == ProgressStatus::Complete {
            p.total_bytes
        } else {
            bytes_processed
        };
    }

    /// An internally consistent copy of the current snapshot.
    pub fn snapshot(&self) -> Progress {
        self.0.lock().unwrap().clone()
    }
}
