use async_trait::async_trait;
use liteque::core::job::{FinalStatus, JobId, JobStatus, QueueStats};
use liteque::core::job_processor::{DequeuedJob, JobError, JobProcessor};
use liteque::core::queue::{Queue, QueueOptions};
use liteque::core::Duration;
use liteque::runner::job_runner::{Runner, RunnerOptions};
use liteque_sqlite::{connect, SqliteQueue};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Work {
    increment: i64,
    #[serde(default)]
    succeed_after: u32,
    #[serde(default)]
    block_for_ms: Option<u64>,
}

impl Work {
    fn add(increment: i64) -> Self {
        Self {
            increment,
            succeed_after: 0,
            block_for_ms: None,
        }
    }
}

#[derive(Default)]
struct Results {
    result: AtomicI64,
    num_called: AtomicU32,
    num_completed: AtomicU32,
    num_failed: AtomicU32,
    num_payload_errors: AtomicU32,
}

impl Results {
    fn snapshot(&self) -> (i64, u32, u32, u32) {
        (
            self.result.load(Ordering::SeqCst),
            self.num_called.load(Ordering::SeqCst),
            self.num_completed.load(Ordering::SeqCst),
            self.num_failed.load(Ordering::SeqCst),
        )
    }
}

/// Holds handlers at a checkpoint until the test lets them through.
#[derive(Clone)]
struct Barrier {
    arrived: Arc<Semaphore>,
    open: Arc<watch::Sender<bool>>,
}

impl Barrier {
    fn closed() -> Self {
        Self {
            arrived: Arc::new(Semaphore::new(0)),
            open: Arc::new(watch::channel(false).0),
        }
    }

    fn opened() -> Self {
        let barrier = Self::closed();
        barrier.allow_participants_to_proceed();
        barrier
    }

    async fn notify_reached_and_wait(&self) {
        self.arrived.add_permits(1);
        let mut open = self.open.subscribe();
        open.wait_for(|open| *open).await.unwrap();
    }

    async fn wait_until_reached(&self, participants: u32) {
        self.arrived
            .acquire_many(participants)
            .await
            .unwrap()
            .forget();
    }

    fn allow_participants_to_proceed(&self) {
        self.open.send_replace(true);
    }
}

struct Worker {
    barrier: Barrier,
    results: Arc<Results>,
}

#[async_trait]
impl JobProcessor for Worker {
    type Payload = Work;
    type Error = anyhow::Error;

    async fn run(&self, job: &DequeuedJob<Work>) -> Result<(), anyhow::Error> {
        self.results.num_called.fetch_add(1, Ordering::SeqCst);
        self.barrier.notify_reached_and_wait().await;

        if job.run_number < job.data.succeed_after {
            anyhow::bail!("failing run {} of job {}", job.run_number, job.id);
        }
        if let Some(block_for_ms) = job.data.block_for_ms {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(block_for_ms)) => {}
                _ = job.abort_signal.cancelled() => anyhow::bail!("aborted"),
            }
        }
        self.results
            .result
            .fetch_add(job.data.increment, Ordering::SeqCst);
        Ok(())
    }

    async fn on_complete(&self, _job: &DequeuedJob<Work>) -> Result<(), anyhow::Error> {
        self.results.num_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn on_error(
        &self,
        _id: JobId,
        data: Option<&Work>,
        error: &JobError,
    ) -> Result<(), anyhow::Error> {
        self.results.num_failed.fetch_add(1, Ordering::SeqCst);
        if error.is_payload_error() && data.is_none() {
            self.results
                .num_payload_errors
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

fn default_options() -> RunnerOptions {
    RunnerOptions::default()
        .with_poll_interval(Duration::from_millis(20))
        .with_timeout(Duration::from_secs(100))
        .with_concurrency(2)
}

fn build_runner(
    queue: &Arc<SqliteQueue>,
    options: RunnerOptions,
    barrier: &Barrier,
    results: &Arc<Results>,
) -> Runner<SqliteQueue, Worker> {
    Runner::new(
        queue.clone(),
        Worker {
            barrier: barrier.clone(),
            results: results.clone(),
        },
        options,
    )
}

async fn memory_queue(name: &str, num_retries: u32) -> Arc<SqliteQueue> {
    let pool = connect(":memory:", true).await.unwrap();
    Arc::new(SqliteQueue::new(
        name,
        pool,
        QueueOptions::new().with_num_retries(num_retries),
    ))
}

async fn wait_until_all_settled(queue: &SqliteQueue) {
    while queue.stats().await.unwrap().unsettled() > 0 {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn corrupt_payload(pool: &SqlitePool, id: JobId, payload: &str) {
    sqlx::query("UPDATE tasks SET payload = ?1 WHERE id = ?2")
        .bind(payload)
        .bind(id)
        .execute(pool)
        .await
        .unwrap();
}

#[tokio::test]
async fn runs_jobs_with_bounded_concurrency() {
    let queue = memory_queue("queue1", 0).await;
    let barrier = Barrier::closed();
    let results = Arc::new(Results::default());
    let runner = Arc::new(build_runner(
        &queue,
        default_options().with_concurrency(2),
        &barrier,
        &results,
    ));

    for increment in 1..=3 {
        queue.enqueue(&Work::add(increment)).await.unwrap();
    }
    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            pending: 3,
            ..Default::default()
        }
    );

    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run_until_empty().await }
    });

    barrier.wait_until_reached(2).await;
    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            pending: 1,
            running: 2,
            ..Default::default()
        }
    );

    barrier.allow_participants_to_proceed();
    handle.await.unwrap();

    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    assert_eq!(results.snapshot(), (6, 3, 3, 0));
}

#[tokio::test]
async fn retries_failed_jobs() {
    let queue = memory_queue("queue1", 2).await;
    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());
    let runner = build_runner(&queue, default_options(), &barrier, &results);

    for (increment, succeed_after) in [(1, 2), (1, 10), (3, 0)] {
        queue
            .enqueue(&Work {
                succeed_after,
                ..Work::add(increment)
            })
            .await
            .unwrap();
    }

    runner.run_until_empty().await;

    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            failed: 1,
            ..Default::default()
        }
    );
    assert_eq!(results.snapshot(), (4, 7, 2, 1));
}

#[tokio::test]
async fn timeouts_are_respected() {
    let queue = memory_queue("queue1", 1).await;
    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());
    let runner = build_runner(
        &queue,
        default_options()
            .with_concurrency(1)
            .with_timeout(Duration::from_secs(1)),
        &barrier,
        &results,
    );

    queue
        .enqueue(&Work {
            block_for_ms: Some(10_000),
            ..Work::add(1)
        })
        .await
        .unwrap();

    runner.run_until_empty().await;

    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            failed: 1,
            ..Default::default()
        }
    );
    assert_eq!(results.snapshot(), (0, 2, 0, 1));
}

#[tokio::test]
async fn corrupt_payloads_never_reach_the_handler() {
    let queue = memory_queue("queue1", 1).await;
    let job = queue.enqueue(&Work::add(1)).await.unwrap();
    corrupt_payload(queue.pool(), job.id, "{}").await;

    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());
    let runner = Arc::new(build_runner(
        &queue,
        default_options().with_concurrency(1),
        &barrier,
        &results,
    ));

    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });
    wait_until_all_settled(&queue).await;
    runner.stop();
    handle.await.unwrap();

    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            failed: 1,
            ..Default::default()
        }
    );
    assert_eq!(results.snapshot(), (0, 0, 0, 1));
}

#[tokio::test]
async fn unparsable_payloads_spend_every_attempt_then_fail() {
    let queue = memory_queue("queue1", 1).await;
    let job = queue.enqueue(&Work::add(1)).await.unwrap();
    corrupt_payload(queue.pool(), job.id, "this is not json").await;

    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());
    let runner = build_runner(&queue, default_options(), &barrier, &results);
    runner.run_until_empty().await;

    assert_eq!(results.snapshot(), (0, 0, 0, 1));
    assert_eq!(results.num_payload_errors.load(Ordering::SeqCst), 1);
    let row = queue.get(job.id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Failed);
    assert_eq!(row.num_runs_left, 0);
    assert_eq!(row.payload, b"this is not json");
}

#[tokio::test]
async fn invalid_utf8_payload_does_not_block_the_queue() {
    let queue = memory_queue("queue1", 1).await;
    let broken = queue.enqueue(&Work::add(1)).await.unwrap();
    queue.enqueue(&Work::add(2)).await.unwrap();
    sqlx::query("UPDATE tasks SET payload = CAST(x'FFFE' AS TEXT) WHERE id = ?1")
        .bind(broken.id)
        .execute(queue.pool())
        .await
        .unwrap();

    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());
    let runner = build_runner(
        &queue,
        default_options().with_concurrency(1),
        &barrier,
        &results,
    );
    tokio::time::timeout(Duration::from_secs(10), runner.run_until_empty())
        .await
        .expect("runner should drain the queue");

    assert_eq!(results.snapshot(), (2, 1, 1, 1));
    assert_eq!(results.num_payload_errors.load(Ordering::SeqCst), 1);
    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            failed: 1,
            ..Default::default()
        }
    );
    let row = queue.get(broken.id).await.unwrap().unwrap();
    assert_eq!(row.num_runs_left, 0);
    assert_eq!(row.payload, vec![0xFF, 0xFE]);
}

#[tokio::test]
async fn validator_rejections_consume_attempts() {
    let queue = memory_queue("queue1", 0).await;
    queue.enqueue(&Work::add(-5)).await.unwrap();
    queue.enqueue(&Work::add(5)).await.unwrap();

    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());
    let runner = build_runner(&queue, default_options(), &barrier, &results).with_validator(
        |work: Work| -> anyhow::Result<Work> {
            anyhow::ensure!(work.increment >= 0, "negative increment {}", work.increment);
            Ok(work)
        },
    );

    runner.run_until_empty().await;

    assert_eq!(queue.stats().await.unwrap().failed, 1);
    assert_eq!(results.snapshot(), (5, 1, 1, 1));
}

#[tokio::test]
async fn concurrent_runners_share_a_queue() {
    let queue = memory_queue("queue1", 0).await;
    for increment in 1..=3 {
        queue.enqueue(&Work::add(increment)).await.unwrap();
    }

    let barrier = Barrier::closed();
    let results = Arc::new(Results::default());
    let runners: Vec<_> = (0..3)
        .map(|_| {
            Arc::new(build_runner(
                &queue,
                default_options().with_concurrency(1),
                &barrier,
                &results,
            ))
        })
        .collect();
    let handles: Vec<_> = runners
        .iter()
        .map(|runner| {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        })
        .collect();

    barrier.wait_until_reached(3).await;
    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            running: 3,
            ..Default::default()
        }
    );

    barrier.allow_participants_to_proceed();
    runners.iter().for_each(|runner| runner.stop());
    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }

    assert_eq!(results.snapshot(), (6, 3, 3, 0));
    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
}

#[tokio::test]
async fn stop_waits_for_in_flight_jobs() {
    let queue = memory_queue("queue1", 0).await;
    queue.enqueue(&Work::add(7)).await.unwrap();

    let barrier = Barrier::closed();
    let results = Arc::new(Results::default());
    let runner = Arc::new(build_runner(&queue, default_options(), &barrier, &results));
    let handle = tokio::spawn({
        let runner = runner.clone();
        async move { runner.run().await }
    });

    barrier.wait_until_reached(1).await;
    runner.stop();
    assert!(!handle.is_finished());

    barrier.allow_participants_to_proceed();
    handle.await.unwrap();

    assert_eq!(results.snapshot(), (7, 1, 1, 0));
    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
}

#[tokio::test]
async fn expired_leases_are_picked_up_by_another_runner() {
    let queue = memory_queue("queue1", 1).await;
    queue.enqueue(&Work::add(2)).await.unwrap();

    // a worker that claims and then disappears
    let abandoned = queue
        .claim(Duration::ZERO)
        .await
        .unwrap()
        .into_job()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());
    build_runner(&queue, default_options(), &barrier, &results)
        .run_until_empty()
        .await;

    assert_eq!(results.snapshot(), (2, 1, 1, 0));
    assert!(!queue
        .finalize(abandoned.id, &abandoned.allocation_id, FinalStatus::Failed)
        .await
        .unwrap());
    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
}

#[tokio::test]
async fn failed_jobs_can_be_dropped() {
    let pool = connect(":memory:", true).await.unwrap();
    let queue = Arc::new(SqliteQueue::new(
        "queue1",
        pool,
        QueueOptions::new().keep_failed_jobs(false),
    ));
    queue
        .enqueue(&Work {
            succeed_after: 1,
            ..Work::add(1)
        })
        .await
        .unwrap();

    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());
    build_runner(&queue, default_options(), &barrier, &results)
        .run_until_empty()
        .await;

    assert_eq!(results.snapshot(), (0, 1, 0, 1));
    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_runners_over_two_queues_on_disk() {
    let path = std::env::temp_dir().join(format!(
        "liteque-runner-{}-{}.db",
        std::process::id(),
        liteque::core::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    ));
    let path = path.to_str().unwrap().to_string();
    let pool = connect(&path, true).await.unwrap();

    let queue1 = Arc::new(SqliteQueue::new("queue1", pool.clone(), QueueOptions::default()));
    let queue2 = Arc::new(SqliteQueue::new("queue2", pool.clone(), QueueOptions::default()));
    let barrier = Barrier::opened();
    let results = Arc::new(Results::default());

    let runners: Vec<_> = (0..10)
        .map(|i| {
            let queue = if i % 2 == 0 { &queue1 } else { &queue2 };
            Arc::new(build_runner(queue, default_options(), &barrier, &results))
        })
        .collect();
    let handles: Vec<_> = runners
        .iter()
        .map(|runner| {
            let runner = runner.clone();
            tokio::spawn(async move { runner.run().await })
        })
        .collect();

    for i in 0..1000 {
        let queue = if i % 2 == 0 { &queue1 } else { &queue2 };
        queue.enqueue(&Work::add(i)).await.unwrap();
    }

    tokio::join!(
        wait_until_all_settled(&queue1),
        wait_until_all_settled(&queue2)
    );
    runners.iter().for_each(|runner| runner.stop());
    for result in futures::future::join_all(handles).await {
        result.unwrap();
    }

    assert_eq!(results.snapshot(), (499_500, 1000, 1000, 0));

    pool.close().await;
    for suffix in ["", "-wal", "-shm"] {
        let _ = std::fs::remove_file(format!("{}{}", path, suffix));
    }
}
