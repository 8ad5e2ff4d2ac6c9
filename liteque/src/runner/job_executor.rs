use super::wrapped_job::wrap_job;
use crate::core::job::{FinalStatus, Job};
use crate::core::job_processor::{DequeuedJob, JobError, JobProcessor};
use crate::core::queue::{Queue, QueueError};
use crate::core::validator::PayloadValidator;
use crate::core::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Shorthand for a shared payload validator.
pub type BoxedValidator<T> = Arc<dyn PayloadValidator<T>>;

/// Executes claimed jobs of one queue with one processor. Responsible for the job lifecycle after
/// a claim: decoding, the handler/timeout race, callbacks and the final write.
///
/// Generally speaking, you don't need to use this type directly, `Runner` takes care of it. If
/// you're driving the queue yourself, hand every job returned by `claim` to [`JobExecutor::process`].
pub struct JobExecutor<Q, P: JobProcessor> {
    queue: Arc<Q>,
    processor: Arc<P>,
    validator: Option<BoxedValidator<P::Payload>>,
    timeout: Duration,
}

impl<Q, P: JobProcessor> Clone for JobExecutor<Q, P> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            processor: self.processor.clone(),
            validator: self.validator.clone(),
            timeout: self.timeout,
        }
    }
}

impl<Q, P> JobExecutor<Q, P>
where
    Q: Queue + 'static,
    P: JobProcessor + 'static,
{
    pub fn new(
        queue: Arc<Q>,
        processor: Arc<P>,
        validator: Option<BoxedValidator<P::Payload>>,
        timeout: Duration,
    ) -> Self {
        Self {
            queue,
            processor,
            validator,
            timeout,
        }
    }

    /// Run one claimed job to completion and write its outcome.
    ///
    /// Only store errors are returned. Handler failures are folded into the job's status.
    #[instrument(skip_all, err, fields(queue = %job.queue, job_id = job.id, run_number = job.run_number()))]
    pub async fn process(&self, job: Job) -> Result<(), QueueError> {
        match wrap_job(&job, self.validator.as_deref(), CancellationToken::new()) {
            Ok(dequeued) => {
                let dequeued = Arc::new(dequeued);
                let job_result = self.run_handler(dequeued.clone()).await;
                self.handle_job_result(&job, Some(&dequeued.data), job_result)
                    .await
            }
            Err(e) => self.handle_job_result(&job, None, Err(e)).await,
        }
    }

    /// Race the handler against the timeout. The handler runs in its own task so that a panic is
    /// contained and so that it can be left running once the runner stops waiting for it.
    async fn run_handler(&self, job: Arc<DequeuedJob<P::Payload>>) -> Result<(), JobError> {
        let processor = self.processor.clone();
        let task_job = job.clone();
        let mut handle = tokio::spawn(async move {
            processor
                .run(&task_job)
                .await
                .map_err(Into::<JobError>::into)
        });

        match tokio::time::timeout(self.timeout, &mut handle).await {
            Ok(Ok(Ok(()))) => self
                .processor
                .on_complete(&job)
                .await
                .map_err(Into::into),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_error)) => Err(JobError::HandlerError(anyhow::anyhow!(
                "Job handler panicked: {}",
                join_error
            ))),
            Err(_elapsed) => {
                tracing::warn!(
                    "Job {} did not settle within {:?}, abandoning the attempt",
                    job.id,
                    self.timeout
                );
                job.abort_signal.cancel();
                // Dropping the handle detaches the task, it keeps running until it notices the signal.
                drop(handle);
                Err(JobError::Timeout(self.timeout))
            }
        }
    }

    async fn handle_job_result(
        &self,
        job: &Job,
        data: Option<&P::Payload>,
        job_result: Result<(), JobError>,
    ) -> Result<(), QueueError> {
        let status = match job_result {
            Ok(()) => FinalStatus::Completed,
            Err(e) => {
                tracing::error!(error_type = e.kind(), "Error during job processing: {}", e);
                if job.has_runs_left() {
                    FinalStatus::PendingRetry
                } else {
                    tracing::warn!("Job {} exhausted its attempts, marking it as failed", job.id);
                    if let Err(callback_error) = self.processor.on_error(job.id, data, &e).await {
                        let callback_error: JobError = callback_error.into();
                        tracing::warn!(
                            "on_error callback for job {} failed: {}",
                            job.id,
                            callback_error
                        );
                    }
                    FinalStatus::Failed
                }
            }
        };

        let owned = self
            .queue
            .finalize(job.id, &job.allocation_id, status)
            .await?;
        if !owned {
            tracing::debug!(
                "Job {} was reclaimed before it could be finalized as {}, dropping the result",
                job.id,
                status
            );
        }
        Ok(())
    }
}
