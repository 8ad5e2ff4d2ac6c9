use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::job::JobId;

/// What a handler receives for one attempt of a job.
#[derive(Debug, Clone)]
pub struct DequeuedJob<T> {
    /// Row id of the job.
    pub id: JobId,
    /// Deserialized and validated payload.
    pub data: T,
    /// Zero-based attempt index.
    pub run_number: u32,
    /// Allocation id of this attempt.
    ///
    /// Handlers that need fencing can compare it against the stored row before a side effect;
    /// once it no longer matches, the attempt has been abandoned.
    pub allocation_id: String,
    /// Cancelled when the runner gives up on this attempt (timeout).
    ///
    /// The runner never aborts a handler. A handler that ignores the signal keeps running
    /// after its row may already have been claimed again.
    pub abort_signal: CancellationToken,
}

/// A job-handler interface. One processor serves one queue.
///
/// The payload type is what the stored JSON is deserialized into before `run` is called. A
/// payload that does not deserialize never reaches the handler.
///
/// ## Example
/// ```rust,ignore
/// use liteque::prelude::{DequeuedJob, JobProcessor, Deserialize};
///
/// #[derive(Deserialize)]
/// struct CrawlRequest {
///     bookmark_id: String,
/// }
///
/// struct Crawler;
///
/// #[async_trait::async_trait]
/// impl JobProcessor for Crawler {
///     type Payload = CrawlRequest;
///     type Error = anyhow::Error;
///
///     async fn run(&self, job: &DequeuedJob<CrawlRequest>) -> Result<(), Self::Error> {
///         tokio::select! {
///             result = crawl(&job.data.bookmark_id) => result,
///             _ = job.abort_signal.cancelled() => Ok(()),
///         }
///     }
/// }
/// ```
///
/// ## Services
/// If your job processor requires external services (database client, REST client, etc.),
/// add them directly as struct fields.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// The input payload for this job handler.
    type Payload: DeserializeOwned + Send + Sync + 'static;

    /// The error type returned by this job.
    type Error: Send + Into<JobError>;

    /// Execute one attempt of the job.
    async fn run(&self, job: &DequeuedJob<Self::Payload>) -> Result<(), Self::Error>;

    /// Called after `run` succeeded, before the row is deleted.
    ///
    /// An error here fails the attempt like an error from `run` would.
    async fn on_complete(&self, _job: &DequeuedJob<Self::Payload>) -> Result<(), Self::Error> {
        Ok(())
    }

    /// Called once when a job fails for the last time, right before it is marked `failed`.
    ///
    /// `data` is `None` when the payload itself was the problem.
    async fn on_error(
        &self,
        _id: JobId,
        _data: Option<&Self::Payload>,
        _error: &JobError,
    ) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Error types for job processing.
#[derive(Error, Debug)]
pub enum JobError {
    /// Stored payload is not valid JSON for the payload type.
    #[error("Failed to deserialize payload: {error}\nPayload sample: {payload_sample}")]
    Deserialization {
        #[source]
        error: serde_json::Error,
        payload_sample: String,
    },

    /// Payload was rejected by the configured validator.
    #[error("Payload failed validation: {0}")]
    Validation(#[source] anyhow::Error),

    /// Handler did not settle within the runner timeout.
    #[error("Job did not complete within the timeout of {0:#?}")]
    Timeout(Duration),

    /// Error from job handler implementation.
    #[error("Job handler error: {0}")]
    HandlerError(#[source] anyhow::Error),
}

impl JobError {
    /// Create a deserialization error with payload context.
    pub fn deserialization_error(error: serde_json::Error, payload: &[u8]) -> Self {
        let payload_sample = String::from_utf8_lossy(payload).chars().take(500).collect();

        Self::Deserialization {
            error,
            payload_sample,
        }
    }

    /// Whether the stored payload was at fault rather than the handler.
    pub fn is_payload_error(&self) -> bool {
        matches!(self, Self::Deserialization { .. } | Self::Validation(_))
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Deserialization { .. } => "deserialization",
            Self::Validation(_) => "validation",
            Self::Timeout(_) => "timeout",
            Self::HandlerError(_) => "handler_error",
        }
    }
}

impl From<Infallible> for JobError {
    fn from(_: Infallible) -> Self {
        unreachable!();
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::HandlerError(error)
    }
}
