use liteque::core::job::{Job, JobStatus};
use liteque::core::queue::QueueError;
use liteque::core::{DateTime, Duration, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub(crate) struct JobRow {
    pub(crate) id: i64,
    pub(crate) queue: String,
    pub(crate) payload: Vec<u8>, // JSON as TEXT, read as raw bytes
    pub(crate) status: String,
    pub(crate) created_at: i64, // unix millis
    pub(crate) expire_at: Option<i64>,
    pub(crate) allocation_id: String,
    pub(crate) num_runs_left: i32,
    pub(crate) max_num_runs: i32,
}

impl JobRow {
    /// Decode into the backend-agnostic job model.
    pub(crate) fn into_job(self) -> Result<Job, QueueError> {
        let status: JobStatus = self
            .status
            .parse()
            .map_err(|e: liteque::core::job::UnknownStatus| {
                QueueError::corrupt_row(self.id, self.queue.clone(), e.to_string())
            })?;
        let created_at = from_millis(self.created_at).ok_or_else(|| {
            QueueError::corrupt_row(
                self.id,
                self.queue.clone(),
                format!("created_at {} out of range", self.created_at),
            )
        })?;
        let expire_at = match self.expire_at {
            Some(ms) => Some(from_millis(ms).ok_or_else(|| {
                QueueError::corrupt_row(
                    self.id,
                    self.queue.clone(),
                    format!("expire_at {} out of range", ms),
                )
            })?),
            None => None,
        };

        Ok(Job {
            id: self.id,
            queue: self.queue,
            payload: self.payload,
            status,
            created_at,
            expire_at,
            allocation_id: self.allocation_id,
            num_runs_left: self.num_runs_left,
            max_num_runs: self.max_num_runs,
        })
    }
}

/// Current time in unix milliseconds, the resolution timestamps are stored with.
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime> {
    DateTime::from_timestamp_millis(ms)
}

/// Lease length in milliseconds, saturating for absurd timeouts.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
