#![doc = include_str!("../../README.md")]

pub mod core;

/// Shared test specifications for backend implementations.
///
/// These test functions ensure consistent claim and finalize behavior across Queue
/// implementations. Backend tests should call these functions with their queue instance.
#[doc(hidden)]
pub mod queue_spec;

/// Default implementation of job runner.
#[cfg(feature = "runner")]
pub mod runner {
    pub mod job_executor;
    pub mod job_runner;
    pub mod wrapped_job;
}

/// Re-exports to simplify importing this crate types.
pub mod prelude {
    pub use super::core::{
        job::{FinalStatus, Job, JobId, JobStatus, QueueStats},
        job_processor::{DequeuedJob, JobError, JobProcessor},
        queue::{ClaimOutcome, Queue, QueueError, QueueOptions},
        validator::PayloadValidator,
        CancellationToken, DateTime, Duration,
    };
    #[cfg(feature = "runner")]
    pub use super::runner::job_runner::{Runner, RunnerOptions};
    pub use serde::{Deserialize, Serialize};
}
