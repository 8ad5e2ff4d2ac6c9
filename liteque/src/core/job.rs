//! The job record and the small state machine encoded in its `status` column.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

use crate::core::DateTime;

/// Row identifier, assigned by the store at insert time.
pub type JobId = i64;

/// Status of a stored job.
///
/// `completed` is not a stored status: completed rows are deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Enqueued and never claimed.
    Pending,
    /// Claimed by a runner and holding a lease until `expire_at`.
    Running,
    /// A previous attempt failed and there are attempts left.
    PendingRetry,
    /// Attempt budget exhausted. Kept for inspection, never retried.
    Failed,
}

impl JobStatus {
    /// The value stored in the `status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::PendingRetry => "pending_retry",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a `status` column holds something outside the state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown job status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "pending_retry" => Ok(JobStatus::PendingRetry),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Outcome written by `finalize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinalStatus {
    /// Delete the row.
    Completed,
    /// Release the lease so the row can be claimed again.
    PendingRetry,
    /// Terminal failure.
    Failed,
}

impl fmt::Display for FinalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FinalStatus::Completed => "completed",
            FinalStatus::PendingRetry => "pending_retry",
            FinalStatus::Failed => "failed",
        })
    }
}

/// A stored job, as returned by `enqueue` and by a successful claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,
    /// Logical queue name. Several queues can share one table.
    pub queue: String,
    /// JSON text as stored, opaque to the queue. Not guaranteed to be valid UTF-8.
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub created_at: DateTime,
    /// Lease deadline. Only set while `status` is `Running`.
    pub expire_at: Option<DateTime>,
    /// Token of the current owner. Regenerated on every claim.
    pub allocation_id: String,
    pub num_runs_left: i32,
    pub max_num_runs: i32,
}

impl Job {
    /// Zero-based attempt index of the current claim.
    ///
    /// A claim decrements `num_runs_left` before the handler runs, so the first
    /// attempt sees `max_num_runs - 1` runs left and gets run number `0`.
    pub fn run_number(&self) -> u32 {
        (self.max_num_runs - self.num_runs_left - 1).max(0) as u32
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn has_runs_left(&self) -> bool {
        self.num_runs_left > 0
    }
}

/// Per-status row counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub running: u64,
    pub pending_retry: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Add `count` rows of `status`.
    pub fn record(&mut self, status: JobStatus, count: u64) {
        match status {
            JobStatus::Pending => self.pending += count,
            JobStatus::Running => self.running += count,
            JobStatus::PendingRetry => self.pending_retry += count,
            JobStatus::Failed => self.failed += count,
        }
    }

    /// Rows that can still make progress (everything except `failed`).
    pub fn unsettled(&self) -> u64 {
        self.pending + self.running + self.pending_retry
    }
}

/// Generate a fresh allocation token.
pub fn new_allocation_id() -> String {
    Uuid::now_v7().simple().to_string()
}
