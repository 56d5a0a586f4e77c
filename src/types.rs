//! Core public types
//!
//! States, snapshots and events exposed to front-ends.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Task identifier. Monotonically allocated by the manager, starting at 1.
/// Recovered tasks get fresh ids; ids do not survive restarts.
pub type TaskId = u64;

/// Lifecycle state of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Waiting for a queue slot
    Queued,
    /// Actively downloading
    Downloading,
    /// Paused by the user (or restored from disk)
    Paused,
    /// Finished and verified
    Completed,
    /// Failed; recoverable via resume
    Failed,
    /// Cancelled; terminal, files removed
    Cancelled,
}

impl TaskState {
    /// Terminal states. `Failed` counts as terminal for queue slot
    /// accounting even though `resume` can revive it.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// States that a `cancel` call can leave
    pub fn is_cancellable(self) -> bool {
        !matches!(self, Self::Completed | Self::Cancelled)
    }
}

/// Progress snapshot produced by the progress monitor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProgressInfo {
    /// Total bytes, 0 when unknown
    pub total_bytes: i64,
    /// Bytes downloaded so far
    pub downloaded_bytes: i64,
    /// Sliding-window speed in bytes/sec
    pub speed_bytes_per_sec: f64,
    /// 0..=100, 0 when the total is unknown
    pub progress_percent: f64,
    /// Estimated seconds remaining, -1 while unknown
    pub remaining_seconds: i64,
}

/// Snapshot of one task for the front-end
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    pub url: String,
    pub file_path: PathBuf,
    pub file_name: String,
    /// 0 while unknown (pre-HEAD or chunked responses)
    pub file_size: i64,
    pub state: TaskState,
    pub progress: ProgressInfo,
    /// Populated when `state == Failed`
    #[serde(default)]
    pub error_message: String,
}

/// Events broadcast by the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskEvent {
    /// A task changed state. Fired only on real changes.
    StateChanged { id: TaskId, state: TaskState },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Queued.is_terminal());
        assert!(!TaskState::Downloading.is_terminal());
        assert!(!TaskState::Paused.is_terminal());
    }

    #[test]
    fn cancellable_states() {
        assert!(TaskState::Queued.is_cancellable());
        assert!(TaskState::Downloading.is_cancellable());
        assert!(TaskState::Paused.is_cancellable());
        assert!(TaskState::Failed.is_cancellable());
        assert!(!TaskState::Completed.is_cancellable());
        assert!(!TaskState::Cancelled.is_cancellable());
    }
}
