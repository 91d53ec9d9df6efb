use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::backoff::Backoff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

impl FromStr for TransferDirection {
    type Err = QueueError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "upload" => Ok(TransferDirection::Upload),
            "download" => Ok(TransferDirection::Download),
            other => Err(QueueError::InvalidDirection(other.to_string())),
        }
    }
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid transfer direction: {0} (expected upload or download)")]
    InvalidDirection(String),
}

/// A transfer that failed and waits for a retry or a bulk clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfflineQueueItem {
    pub rom_id: i64,
    pub filename: String,
    pub operation: TransferDirection,
    pub error: String,
    pub failed_at: i64,
    pub attempt_count: u32,
}

impl OfflineQueueItem {
    /// Earliest unix time at which a background retry may run.
    pub fn retry_after(&self, backoff: &Backoff) -> i64 {
        let wait = backoff.ceiling(self.attempt_count.saturating_sub(1));
        self.failed_at
            .saturating_add(i64::try_from(wait.as_secs()).unwrap_or(i64::MAX))
    }

    pub fn is_due(&self, now: i64, backoff: &Backoff) -> bool {
        now >= self.retry_after(backoff)
    }
}

/// A save whose local and remote copies diverged and that waits for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConflict {
    pub rom_id: i64,
    pub filename: String,
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
    pub local_mtime: Option<i64>,
    pub remote_mtime: Option<i64>,
    pub remote_save_id: Option<i64>,
    pub created_at: i64,
}
