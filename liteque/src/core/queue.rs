use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use crate::core::job::{FinalStatus, Job, JobId, QueueStats};
use crate::core::Duration;

/// Per-queue options applied at enqueue and finalize time.
///
/// # Examples
///
/// ```rust
/// use liteque::core::queue::QueueOptions;
///
/// // Five attempts in total, failed rows are deleted instead of kept.
/// let opts = QueueOptions::new()
///     .with_num_retries(4)
///     .keep_failed_jobs(false);
///
/// assert_eq!(opts.max_num_runs(), 5);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub(crate) num_retries: u32,
    pub(crate) keep_failed_jobs: bool,
}

impl QueueOptions {
    /// Create options with default values (no retries, failed jobs kept).
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retries after the first attempt.
    pub fn with_num_retries(mut self, num_retries: u32) -> Self {
        self.num_retries = num_retries;
        self
    }

    /// Whether rows that exhausted their attempts stay in the table as `failed`.
    ///
    /// When disabled, a terminal failure deletes the row.
    pub fn keep_failed_jobs(mut self, keep: bool) -> Self {
        self.keep_failed_jobs = keep;
        self
    }

    /// Get the number of retries.
    pub fn num_retries(&self) -> u32 {
        self.num_retries
    }

    /// Get whether failed jobs are kept.
    pub fn keeps_failed_jobs(&self) -> bool {
        self.keep_failed_jobs
    }

    /// Attempt budget stored on each new row.
    pub fn max_num_runs(&self) -> i32 {
        i32::try_from(self.num_retries)
            .unwrap_or(i32::MAX - 1)
            .saturating_add(1)
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            num_retries: 0,
            keep_failed_jobs: true,
        }
    }
}

/// Result of a single claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The row now belongs to the caller until its lease expires.
    Claimed(Job),
    /// No row of the queue is eligible right now.
    Empty,
    /// An eligible row was seen but a competing claimer won it.
    ///
    /// The queue is not necessarily empty; poll again.
    Contended,
}

impl ClaimOutcome {
    /// Extract the claimed job, if any.
    pub fn into_job(self) -> Option<Job> {
        match self {
            ClaimOutcome::Claimed(job) => Some(job),
            ClaimOutcome::Empty | ClaimOutcome::Contended => None,
        }
    }
}

/// A named queue over a durable task store. Responsible for pushing jobs in and for the atomic
/// claim/finalize transitions used by the runner.
///
/// ### Ordering
///
/// Eligible rows are claimed oldest first. Retried jobs keep their original creation time, so
/// they resurface near the front of the queue.
///
/// ### Ownership
///
/// Every claim hands out a fresh allocation id. `finalize` only has an effect while the caller's
/// allocation id is still the current one; once the lease lapses and another claimer takes the
/// row, the old holder's finalize is silently dropped.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Name of the queue this handle is bound to.
    fn name(&self) -> &str;

    /// Options this handle was built with.
    fn options(&self) -> &QueueOptions;

    /// Serialize `payload` to JSON and insert it as a new pending job.
    ///
    /// No validation happens here; payload shape is checked when a runner claims the job.
    ///
    /// ```rust,ignore
    /// let job = queue.enqueue(&CrawlRequest { bookmark_id: "b1".into() }).await?;
    /// assert_eq!(job.status, JobStatus::Pending);
    /// ```
    async fn enqueue<T>(&self, payload: &T) -> Result<Job, QueueError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = serde_json::to_string(payload)
            .map_err(|e| QueueError::serialize_error(self.name().to_string(), e))?;
        self.enqueue_serialized(payload).await
    }

    /// Insert an already serialized payload as a new pending job.
    async fn enqueue_serialized(&self, payload: String) -> Result<Job, QueueError>;

    /// Per-status counts for this queue, read as one snapshot.
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Try to claim the oldest eligible job, leasing it for `timeout`.
    ///
    /// Eligible means attempts left and either pending, pending retry, or running with an expired
    /// lease. Does not wait.
    async fn claim(&self, timeout: Duration) -> Result<ClaimOutcome, QueueError>;

    /// Claim primitive that folds a lost race into `None`.
    ///
    /// A `None` here does not prove the queue is empty. Use [`Queue::claim`] to tell the two apart.
    async fn attempt_dequeue(&self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        Ok(self.claim(timeout).await?.into_job())
    }

    /// Write the outcome of an attempt, conditioned on `allocation_id` still owning the row.
    ///
    /// Returns `false` when the allocation id is stale (or the row is gone). That is not an
    /// error: whoever holds the row now will finalize it.
    async fn finalize(
        &self,
        id: JobId,
        allocation_id: &str,
        status: FinalStatus,
    ) -> Result<bool, QueueError>;
}

/// Errors related to queue operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// Failed to serialize payload.
    #[error("Failed to serialize payload for queue '{queue}': {error}")]
    SerializeError {
        queue: String,
        #[source]
        error: serde_json::Error,
    },

    /// A stored row could not be decoded.
    #[error("Failed to decode job {job_id} of queue '{queue}': {reason}")]
    CorruptRow {
        job_id: JobId,
        queue: String,
        reason: String,
    },

    /// Database or other backend error.
    #[error("Database error: {0}")]
    DatabaseError(#[from] anyhow::Error),
}

impl QueueError {
    /// Create a serialize error with queue context.
    pub fn serialize_error(queue: String, error: serde_json::Error) -> Self {
        Self::SerializeError { queue, error }
    }

    /// Create an error for a row that does not match the job model.
    pub fn corrupt_row(job_id: JobId, queue: String, reason: impl Into<String>) -> Self {
        Self::CorruptRow {
            job_id,
            queue,
            reason: reason.into(),
        }
    }
}
