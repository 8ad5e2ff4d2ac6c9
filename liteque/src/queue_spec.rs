//! Shared test specifications for Queue implementations.
//!
//! These test functions can be called by any backend to check that it honours the claim and
//! finalize rules the runner relies on.

/// Generate all queue spec test wrappers for a backend.
///
/// # Usage
///
/// ```ignore
/// liteque::generate_queue_spec_tests! {
///     backend = "sqlite",
///     test_attr = sqlx::test(migrator = "MIGRATOR"),
///     setup = |pool: SqlitePool| {
///         SqliteQueue::new("spec", pool, QueueOptions::new().with_num_retries(2))
///     }
/// }
/// ```
///
/// The setup expression must build a handle over an empty store, with failed jobs kept and at
/// least two runs per job (see [`QueueOptions`]).
///
/// [`QueueOptions`]: crate::core::queue::QueueOptions
#[macro_export]
macro_rules! generate_queue_spec_tests {
    (
        backend = $backend:literal,
        test_attr = $test_attr:meta,
        setup = |$pool:ident: $pool_type:ty| $setup_expr:expr
    ) => {
        paste::paste! {
            // Enqueue and inspection
            #[$test_attr]
            async fn [<enqueue_returns_pending_row_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_enqueue_returns_pending_row(queue).await;
            }

            #[$test_attr]
            async fn [<stats_counts_by_status_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_stats_counts_by_status(queue).await;
            }

            // Claiming
            #[$test_attr]
            async fn [<claim_empty_queue_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_claim_empty_queue(queue).await;
            }

            #[$test_attr]
            async fn [<claim_oldest_first_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_claim_oldest_first(queue).await;
            }

            #[$test_attr]
            async fn [<claim_sets_lease_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_claim_sets_lease(queue).await;
            }

            #[$test_attr]
            async fn [<running_job_not_claimable_before_expiry_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_running_job_not_claimable_before_expiry(queue).await;
            }

            #[$test_attr]
            async fn [<expired_lease_is_reclaimable_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_expired_lease_is_reclaimable(queue).await;
            }

            #[$test_attr]
            async fn [<concurrent_claims_never_share_a_row_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_concurrent_claims_never_share_a_row(queue).await;
            }

            // Finalizing
            #[$test_attr]
            async fn [<complete_deletes_row_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_complete_deletes_row(queue).await;
            }

            #[$test_attr]
            async fn [<pending_retry_is_reclaimed_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_pending_retry_is_reclaimed(queue).await;
            }

            #[$test_attr]
            async fn [<failed_row_is_kept_and_not_claimable_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_failed_row_is_kept_and_not_claimable(queue).await;
            }

            #[$test_attr]
            async fn [<exhausted_budget_is_not_claimable_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_exhausted_budget_is_not_claimable(queue).await;
            }

            #[$test_attr]
            async fn [<stale_finalize_is_noop_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_stale_finalize_is_noop(queue).await;
            }

            #[$test_attr]
            async fn [<second_finalize_is_noop_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_second_finalize_is_noop(queue).await;
            }

            // Payloads
            #[$test_attr]
            async fn [<payload_roundtrip_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_payload_roundtrip(queue).await;
            }

            #[$test_attr]
            async fn [<attempt_dequeue_matches_claim_ $backend>]($pool: $pool_type) {
                let queue = $setup_expr;
                $crate::queue_spec::test_attempt_dequeue_matches_claim(queue).await;
            }
        }
    };
}

use crate::core::job::{FinalStatus, JobStatus, QueueStats};
use crate::core::queue::{ClaimOutcome, Queue};
use crate::core::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

const LEASE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SpecPayload {
    name: String,
    tags: Vec<String>,
    weight: Option<f64>,
}

async fn claim_job<Q: Queue>(queue: &Q, timeout: Duration) -> crate::core::job::Job {
    match queue.claim(timeout).await.unwrap() {
        ClaimOutcome::Claimed(job) => job,
        other => panic!("Expected a claimed job, got {:?}", other),
    }
}

/// A fresh row is pending with its full budget and no lease.
pub async fn test_enqueue_returns_pending_row<Q>(queue: Q)
where
    Q: Queue,
{
    assert!(queue.options().max_num_runs() >= 2);
    assert!(queue.options().keeps_failed_jobs());

    let job = queue.enqueue(&serde_json::json!({"n": 1})).await.unwrap();

    assert_eq!(job.queue, queue.name());
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.expire_at, None);
    assert_eq!(job.max_num_runs, queue.options().max_num_runs());
    assert_eq!(job.num_runs_left, job.max_num_runs);
    assert!(!job.allocation_id.is_empty());
    assert!(job.created_at <= Utc::now());

    let payload: serde_json::Value = serde_json::from_slice(&job.payload).unwrap();
    assert_eq!(payload, serde_json::json!({"n": 1}));
}

/// Stats reflect every status transition.
pub async fn test_stats_counts_by_status<Q>(queue: Q)
where
    Q: Queue,
{
    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());

    for n in 0..4 {
        queue.enqueue(&n).await.unwrap();
    }
    let first = claim_job(&queue, LEASE).await;
    let second = claim_job(&queue, LEASE).await;
    let third = claim_job(&queue, LEASE).await;
    assert!(queue
        .finalize(second.id, &second.allocation_id, FinalStatus::PendingRetry)
        .await
        .unwrap());
    assert!(queue
        .finalize(third.id, &third.allocation_id, FinalStatus::Failed)
        .await
        .unwrap());

    assert_eq!(
        queue.stats().await.unwrap(),
        QueueStats {
            pending: 1,
            running: 1,
            pending_retry: 1,
            failed: 1,
        }
    );

    assert!(queue
        .finalize(first.id, &first.allocation_id, FinalStatus::Completed)
        .await
        .unwrap());
    assert_eq!(queue.stats().await.unwrap().running, 0);
}

/// Claiming from an empty queue reports `Empty`, not an error.
pub async fn test_claim_empty_queue<Q>(queue: Q)
where
    Q: Queue,
{
    assert_eq!(queue.claim(LEASE).await.unwrap(), ClaimOutcome::Empty);
    assert!(queue.attempt_dequeue(LEASE).await.unwrap().is_none());
}

/// Rows are claimed in insertion order.
pub async fn test_claim_oldest_first<Q>(queue: Q)
where
    Q: Queue,
{
    let mut enqueued = Vec::new();
    for n in 0..5 {
        enqueued.push(queue.enqueue(&n).await.unwrap().id);
    }

    let mut claimed = Vec::new();
    for _ in 0..5 {
        claimed.push(claim_job(&queue, LEASE).await.id);
    }

    assert_eq!(claimed, enqueued);
    assert_eq!(queue.claim(LEASE).await.unwrap(), ClaimOutcome::Empty);
}

/// A claim marks the row running, spends one run and hands out a new allocation id.
pub async fn test_claim_sets_lease<Q>(queue: Q)
where
    Q: Queue,
{
    let enqueued = queue.enqueue("lease").await.unwrap();
    let before = Utc::now();

    let claimed = claim_job(&queue, LEASE).await;

    assert_eq!(claimed.id, enqueued.id);
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.num_runs_left, enqueued.num_runs_left - 1);
    assert_ne!(claimed.allocation_id, enqueued.allocation_id);
    assert_eq!(claimed.run_number(), 0);
    assert_eq!(claimed.created_at, enqueued.created_at);

    let expire_at = claimed.expire_at.expect("running row must carry a lease");
    let lease = chrono::Duration::from_std(LEASE).unwrap();
    // Timestamps are stored with millisecond precision.
    let slack = chrono::Duration::milliseconds(5);
    assert!(expire_at >= before + lease - slack);
    assert!(expire_at <= Utc::now() + lease + slack);
}

/// A live lease keeps other claimers away.
pub async fn test_running_job_not_claimable_before_expiry<Q>(queue: Q)
where
    Q: Queue,
{
    queue.enqueue(&1).await.unwrap();
    let _claimed = claim_job(&queue, LEASE).await;

    assert_eq!(queue.claim(LEASE).await.unwrap(), ClaimOutcome::Empty);
}

/// Once a lease lapses the row is claimable again and the old holder loses it.
pub async fn test_expired_lease_is_reclaimable<Q>(queue: Q)
where
    Q: Queue,
{
    queue.enqueue(&1).await.unwrap();
    let first = claim_job(&queue, Duration::ZERO).await;
    assert!(first.has_runs_left());

    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = claim_job(&queue, LEASE).await;
    assert_eq!(second.id, first.id);
    assert_ne!(second.allocation_id, first.allocation_id);
    assert_eq!(second.num_runs_left, first.num_runs_left - 1);

    assert!(!queue
        .finalize(first.id, &first.allocation_id, FinalStatus::Completed)
        .await
        .unwrap());
    assert_eq!(queue.stats().await.unwrap().running, 1);
}

/// Many claimers racing over the same rows never receive the same one.
pub async fn test_concurrent_claims_never_share_a_row<Q>(queue: Q)
where
    Q: Queue + 'static,
{
    const JOBS: usize = 10;
    const CLAIMERS: usize = 4;

    for n in 0..JOBS {
        queue.enqueue(&n).await.unwrap();
    }

    let queue = Arc::new(queue);
    let mut claimers = Vec::new();
    for _ in 0..CLAIMERS {
        let queue = queue.clone();
        claimers.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            loop {
                match queue.claim(LEASE).await.unwrap() {
                    ClaimOutcome::Claimed(job) => ids.push(job.id),
                    ClaimOutcome::Contended => tokio::task::yield_now().await,
                    ClaimOutcome::Empty => break ids,
                }
            }
        }));
    }

    let mut seen = HashSet::new();
    for claimer in claimers {
        for id in claimer.await.unwrap() {
            assert!(seen.insert(id), "job {} was claimed twice", id);
        }
    }
    assert_eq!(seen.len(), JOBS);
    assert_eq!(queue.stats().await.unwrap().running, JOBS as u64);
}

/// Completing a job removes it.
pub async fn test_complete_deletes_row<Q>(queue: Q)
where
    Q: Queue,
{
    queue.enqueue(&1).await.unwrap();
    let job = claim_job(&queue, LEASE).await;

    assert!(queue
        .finalize(job.id, &job.allocation_id, FinalStatus::Completed)
        .await
        .unwrap());

    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
    assert_eq!(queue.claim(LEASE).await.unwrap(), ClaimOutcome::Empty);
}

/// A released row comes back with one run fewer.
pub async fn test_pending_retry_is_reclaimed<Q>(queue: Q)
where
    Q: Queue,
{
    queue.enqueue(&1).await.unwrap();
    let first = claim_job(&queue, LEASE).await;

    assert!(queue
        .finalize(first.id, &first.allocation_id, FinalStatus::PendingRetry)
        .await
        .unwrap());

    let second = claim_job(&queue, LEASE).await;
    assert_eq!(second.id, first.id);
    assert_eq!(second.num_runs_left, first.num_runs_left - 1);
    assert_eq!(second.run_number(), 1);
}

/// Failed rows stay visible and are never handed out again.
pub async fn test_failed_row_is_kept_and_not_claimable<Q>(queue: Q)
where
    Q: Queue,
{
    queue.enqueue(&1).await.unwrap();
    let job = claim_job(&queue, LEASE).await;

    assert!(queue
        .finalize(job.id, &job.allocation_id, FinalStatus::Failed)
        .await
        .unwrap());

    assert_eq!(queue.stats().await.unwrap().failed, 1);
    assert_eq!(queue.claim(LEASE).await.unwrap(), ClaimOutcome::Empty);
}

/// Rows without runs left are skipped even when pending.
pub async fn test_exhausted_budget_is_not_claimable<Q>(queue: Q)
where
    Q: Queue,
{
    queue.enqueue(&1).await.unwrap();
    let max = queue.options().max_num_runs();

    let mut last = claim_job(&queue, LEASE).await;
    for _ in 1..max {
        assert!(queue
            .finalize(last.id, &last.allocation_id, FinalStatus::PendingRetry)
            .await
            .unwrap());
        last = claim_job(&queue, LEASE).await;
    }
    assert_eq!(last.num_runs_left, 0);
    assert_eq!(last.run_number(), (max - 1) as u32);

    assert!(queue
        .finalize(last.id, &last.allocation_id, FinalStatus::PendingRetry)
        .await
        .unwrap());
    assert_eq!(queue.claim(LEASE).await.unwrap(), ClaimOutcome::Empty);
}

/// A finalize with an allocation id that never owned the row changes nothing.
pub async fn test_stale_finalize_is_noop<Q>(queue: Q)
where
    Q: Queue,
{
    let enqueued = queue.enqueue(&1).await.unwrap();
    let job = claim_job(&queue, LEASE).await;

    // the allocation id issued at enqueue time is stale after the claim
    assert!(!queue
        .finalize(job.id, &enqueued.allocation_id, FinalStatus::Completed)
        .await
        .unwrap());
    assert!(!queue
        .finalize(job.id, "not-an-allocation", FinalStatus::Failed)
        .await
        .unwrap());

    assert_eq!(queue.stats().await.unwrap().running, 1);
}

/// Only the first of two finalizes by the same holder applies when the first removes the row.
pub async fn test_second_finalize_is_noop<Q>(queue: Q)
where
    Q: Queue,
{
    queue.enqueue(&1).await.unwrap();
    let job = claim_job(&queue, LEASE).await;

    assert!(queue
        .finalize(job.id, &job.allocation_id, FinalStatus::Completed)
        .await
        .unwrap());
    assert!(!queue
        .finalize(job.id, &job.allocation_id, FinalStatus::Failed)
        .await
        .unwrap());

    assert_eq!(queue.stats().await.unwrap(), QueueStats::default());
}

/// Structured payloads survive the trip through the store unchanged.
pub async fn test_payload_roundtrip<Q>(queue: Q)
where
    Q: Queue,
{
    let payload = SpecPayload {
        name: "quotes \" and unicode ✓".to_string(),
        tags: vec!["a".to_string(), String::new(), "c'd".to_string()],
        weight: Some(0.25),
    };
    queue.enqueue(&payload).await.unwrap();

    let job = claim_job(&queue, LEASE).await;
    let decoded: SpecPayload = serde_json::from_slice(&job.payload).unwrap();

    assert_eq!(decoded, payload);
}

/// `attempt_dequeue` is a claim that drops the outcome detail.
pub async fn test_attempt_dequeue_matches_claim<Q>(queue: Q)
where
    Q: Queue,
{
    let enqueued = queue.enqueue(&1).await.unwrap();

    let job = queue.attempt_dequeue(LEASE).await.unwrap().unwrap();
    assert_eq!(job.id, enqueued.id);
    assert_eq!(job.status, JobStatus::Running);

    assert!(queue.attempt_dequeue(LEASE).await.unwrap().is_none());
}
