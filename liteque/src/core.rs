//! Implementation agnostic traits for implementing queues and re-exports of 3rd party types/crates used in public interface.

/// An alias for `chrono::DateTime<chrono::Utc>`
pub type DateTime = chrono::DateTime<chrono::Utc>;
pub use chrono::Utc;
pub use serde_json;
pub use std::time::Duration;
pub use tokio_util::sync::CancellationToken;

pub mod job;
pub mod job_processor;
pub mod queue;
pub mod validator;
