use crate::types::{duration_millis, now_millis, JobRow};
use anyhow::Context;
use async_trait::async_trait;
use liteque::core::job::{new_allocation_id, FinalStatus, Job, JobId, JobStatus, QueueStats};
use liteque::core::queue::{ClaimOutcome, Queue, QueueError, QueueOptions};
use liteque::core::Duration;
use sqlx::{FromRow, SqlitePool};
use tracing::instrument;

/// An implementation of the Queue backed by SQLite.
///
/// Any number of handles, with different names, can share one pool and one `tasks` table.
#[derive(Clone)]
pub struct SqliteQueue {
    name: String,
    pub(crate) pool: SqlitePool,
    options: QueueOptions,
}

impl SqliteQueue {
    pub fn new(name: impl Into<String>, pool: SqlitePool, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            pool,
            options,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Load a row of this queue by id, whatever its status.
    #[instrument(skip_all, err, fields(queue = %self.name, job_id = id))]
    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>("SELECT * FROM tasks WHERE id = ?1 AND queue = ?2")
            .bind(id)
            .bind(&self.name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to load job")?;

        row.map(JobRow::into_job).transpose()
    }

    async fn try_claim(&self, timeout: Duration) -> Result<RawClaim, sqlx::Error> {
        let now = now_millis();
        let mut tx = self.pool.begin().await?;

        let candidate: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, allocation_id FROM tasks
             WHERE queue = ?1
               AND num_runs_left > 0
               AND (status IN ('pending', 'pending_retry')
                    OR (status = 'running' AND expire_at < ?2))
             ORDER BY created_at ASC, id ASC
             LIMIT 1",
        )
        .bind(&self.name)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((id, allocation_id)) = candidate else {
            return Ok(RawClaim::Empty);
        };

        let row = sqlx::query(
            "UPDATE tasks
             SET status = 'running',
                 num_runs_left = num_runs_left - 1,
                 allocation_id = ?1,
                 expire_at = ?2
             WHERE id = ?3 AND allocation_id = ?4
             RETURNING *",
        )
        .bind(new_allocation_id())
        .bind(now.saturating_add(duration_millis(timeout)))
        .bind(id)
        .bind(allocation_id)
        .try_map(|row| JobRow::from_row(&row))
        .fetch_optional(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(match row {
            Some(row) => RawClaim::Claimed(row),
            None => RawClaim::Contended,
        })
    }
}

enum RawClaim {
    Claimed(JobRow),
    Empty,
    Contended,
}

/// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes.
fn is_contention(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(e) => matches!(
            e.code().as_deref(),
            Some("5" | "6" | "261" | "262" | "517" | "773")
        ),
        _ => false,
    }
}

#[async_trait]
impl Queue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> &QueueOptions {
        &self.options
    }

    #[instrument(skip_all, err, fields(queue = %self.name))]
    async fn enqueue_serialized(&self, payload: String) -> Result<Job, QueueError> {
        let max_num_runs = self.options.max_num_runs();

        let row = sqlx::query_as::<_, JobRow>(
            "INSERT INTO tasks (queue, payload, status, created_at, allocation_id, num_runs_left, max_num_runs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             RETURNING *",
        )
        .bind(&self.name)
        .bind(payload)
        .bind(JobStatus::Pending.as_str())
        .bind(now_millis())
        .bind(new_allocation_id())
        .bind(max_num_runs)
        .fetch_one(&self.pool)
        .await
        .context("Failed to add job to the queue")?;

        let job = row.into_job()?;
        tracing::debug!(job_id = job.id, "Enqueued job");
        Ok(job)
    }

    #[instrument(skip_all, err, ret, fields(queue = %self.name))]
    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM tasks WHERE queue = ?1 GROUP BY status",
        )
        .bind(&self.name)
        .fetch_all(&self.pool)
        .await
        .context("Failed to collect queue stats")?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            let status: JobStatus = status
                .parse()
                .with_context(|| format!("Unexpected status in queue '{}'", self.name))?;
            stats.record(status, count.max(0) as u64);
        }
        Ok(stats)
    }

    #[instrument(skip_all, err, fields(queue = %self.name, timeout = ?timeout))]
    async fn claim(&self, timeout: Duration) -> Result<ClaimOutcome, QueueError> {
        match self.try_claim(timeout).await {
            // Decoded after commit, a corrupt row stays claimed and surfaces as an error.
            Ok(RawClaim::Claimed(row)) => Ok(ClaimOutcome::Claimed(row.into_job()?)),
            Ok(RawClaim::Empty) => Ok(ClaimOutcome::Empty),
            Ok(RawClaim::Contended) => Ok(ClaimOutcome::Contended),
            Err(e) if is_contention(&e) => {
                tracing::debug!("Claim lost to a concurrent writer: {}", e);
                Ok(ClaimOutcome::Contended)
            }
            Err(e) => Err(anyhow::Error::new(e)
                .context("Failed to claim a job from the queue")
                .into()),
        }
    }

    #[instrument(skip_all, err, fields(queue = %self.name, job_id = id, status = %status))]
    async fn finalize(
        &self,
        id: JobId,
        allocation_id: &str,
        status: FinalStatus,
    ) -> Result<bool, QueueError> {
        let query = match status {
            FinalStatus::Completed => {
                sqlx::query("DELETE FROM tasks WHERE id = ?1 AND allocation_id = ?2")
            }
            FinalStatus::Failed if !self.options.keeps_failed_jobs() => {
                sqlx::query("DELETE FROM tasks WHERE id = ?1 AND allocation_id = ?2")
            }
            FinalStatus::PendingRetry => sqlx::query(
                "UPDATE tasks SET status = 'pending_retry', expire_at = NULL
                 WHERE id = ?1 AND allocation_id = ?2",
            ),
            FinalStatus::Failed => sqlx::query(
                "UPDATE tasks SET status = 'failed', expire_at = NULL
                 WHERE id = ?1 AND allocation_id = ?2",
            ),
        };

        let result = query
            .bind(id)
            .bind(allocation_id)
            .execute(&self.pool)
            .await
            .context("Failed to finalize job")?;

        Ok(result.rows_affected() > 0)
    }
}
