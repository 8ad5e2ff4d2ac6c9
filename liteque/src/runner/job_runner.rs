use super::job_executor::{BoxedValidator, JobExecutor};
use crate::core::job_processor::JobProcessor;
use crate::core::queue::{ClaimOutcome, Queue};
use crate::core::validator::PayloadValidator;
use crate::core::Duration;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// Options for the job runner.
///
/// # Examples
///
/// ```rust
/// use liteque::runner::job_runner::RunnerOptions;
/// use std::time::Duration;
///
/// let opts = RunnerOptions::default()
///     .with_concurrency(4)
///     .with_poll_interval(Duration::from_millis(250))
///     .with_timeout(Duration::from_secs(30));
///
/// assert_eq!(opts.concurrency(), 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    poll_interval: Duration,
    timeout: Duration,
    concurrency: usize,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            concurrency: 1,
        }
    }
}

impl RunnerOptions {
    /// How long to sleep after a poll that found nothing to claim.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Lease length of a claim and the time a handler gets before the attempt is abandoned.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Maximum number of jobs executed at once. Zero is treated as one.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }
}

/// A bounded worker pool polling a single queue.
///
/// A claim is only issued while holding one of `concurrency` permits, so this runner never has
/// more than `concurrency` of its own jobs in `running`. Several runners (in this process or in
/// others) can work the same queue; the store decides who gets a row.
///
/// ## Example
/// ```rust,ignore
/// let runner = Runner::new(queue.clone(), Crawler::new(client), RunnerOptions::default())
///     .with_validator(|req: CrawlRequest| -> anyhow::Result<CrawlRequest> {
///         anyhow::ensure!(!req.bookmark_id.is_empty(), "empty bookmark id");
///         Ok(req)
///     });
///
/// let shutdown = runner.shutdown_token();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     shutdown.cancel();
/// });
///
/// runner.run().await;
/// ```
pub struct Runner<Q, P: JobProcessor> {
    queue: Arc<Q>,
    processor: Arc<P>,
    validator: Option<BoxedValidator<P::Payload>>,
    options: RunnerOptions,
    shutdown: CancellationToken,
}

impl<Q, P> Runner<Q, P>
where
    Q: Queue + 'static,
    P: JobProcessor + 'static,
{
    pub fn new(queue: Arc<Q>, processor: P, options: RunnerOptions) -> Self {
        Self {
            queue,
            processor: Arc::new(processor),
            validator: None,
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Check (and possibly rewrite) every payload before it reaches the handler.
    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: PayloadValidator<P::Payload> + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    /// Ask a running loop to stop. In-flight jobs are awaited, no new claims are made.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Token that stops this runner when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Poll and process jobs until [`Runner::stop`] is called.
    pub async fn run(&self) {
        self.run_impl(false).await
    }

    /// Like [`Runner::run`], but also returns once a poll finds nothing to claim and no job is in
    /// flight.
    pub async fn run_until_empty(&self) {
        self.run_impl(true).await
    }

    async fn run_impl(&self, break_on_empty: bool) {
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let executor = JobExecutor::new(
            self.queue.clone(),
            self.processor.clone(),
            self.validator.clone(),
            self.options.timeout,
        );
        let mut in_flight = JoinSet::new();

        tracing::debug!(
            queue = self.queue.name(),
            concurrency = self.options.concurrency,
            "Starting runner"
        );

        while !self.shutdown.is_cancelled() {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = self.shutdown.cancelled() => break,
            };
            reap_finished(&mut in_flight);

            match self.queue.claim(self.options.timeout).await {
                Ok(ClaimOutcome::Claimed(job)) => {
                    let executor = executor.clone();
                    in_flight.spawn(async move {
                        let _permit = permit;
                        let job_id = job.id;
                        if let Err(e) = executor.process(job).await {
                            // The lease runs out and the row is claimed again.
                            tracing::warn!("Failed to record the outcome of job {}: {}", job_id, e);
                        }
                    });
                }
                Ok(ClaimOutcome::Contended) => {
                    drop(permit);
                    tokio::task::yield_now().await;
                }
                Ok(ClaimOutcome::Empty) => {
                    drop(permit);
                    reap_finished(&mut in_flight);
                    if break_on_empty && in_flight.is_empty() {
                        tracing::debug!(queue = self.queue.name(), "Queue drained, stopping runner");
                        break;
                    }
                    self.idle(self.options.poll_interval).await;
                }
                Err(e) => {
                    drop(permit);
                    tracing::error!("Encountered QueueError: {}", e);
                    self.idle(self.options.poll_interval).await;
                }
            }
        }

        while let Some(result) = in_flight.join_next().await {
            log_join_result(result);
        }
        tracing::debug!(queue = self.queue.name(), "Runner stopped");
    }

    async fn idle(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}

fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(result) = in_flight.try_join_next() {
        log_join_result(result);
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        tracing::error!("Job task terminated abnormally: {}", e);
    }
}
