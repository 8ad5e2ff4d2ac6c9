use crate::core::job::Job;
use crate::core::job_processor::{DequeuedJob, JobError};
use crate::core::validator::PayloadValidator;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Turn a claimed row into the envelope handed to the handler.
///
/// The stored JSON is deserialized into `T` and then passed through `validator`, if any. Both
/// failures come back as payload errors; the handler never sees a payload that failed either step.
#[instrument(skip_all, fields(job_id = job.id, queue = %job.queue))]
pub fn wrap_job<T>(
    job: &Job,
    validator: Option<&dyn PayloadValidator<T>>,
    abort_signal: CancellationToken,
) -> Result<DequeuedJob<T>, JobError>
where
    T: DeserializeOwned,
{
    let data: T = serde_json::from_slice(&job.payload)
        .map_err(|error| JobError::deserialization_error(error, &job.payload))?;

    let data = match validator {
        Some(validator) => validator.validate(data).map_err(JobError::Validation)?,
        None => data,
    };

    Ok(DequeuedJob {
        id: job.id,
        data,
        run_number: job.run_number(),
        allocation_id: job.allocation_id.clone(),
        abort_signal,
    })
}
