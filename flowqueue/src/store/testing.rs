//! Test suite for ensuring a correct implementation of a [`QueueStore`].
use chrono::{TimeDelta, Utc};

use super::*;
use crate::{
    backoff::DEFAULT_BACKOFF,
    job::{Job, JobStatus},
};

fn mock_job() -> Job {
    Job::workflow_execution("user", "workflow", serde_json::json!({"key": "value"}))
}

/// Dequeue the job and record it as running, the way a worker does.
async fn claim(store: &impl QueueStore) -> Job {
    let mut job = store.dequeue().await.unwrap();
    job.set_running().unwrap();
    store.update(&job).await.unwrap();
    job
}

/// Create test suite for a [`QueueStore`] implementation.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use flowqueue::queue_store_test_suite;
/// use flowqueue::store::memory::InMemoryQueueStore;
/// queue_store_test_suite!(for: InMemoryQueueStore::new());
/// ```
///
/// Extra attributes can be passed, for example to skip tests that need external services unless
/// explicitly requested:
///
/// ```ignore
/// queue_store_test_suite!(
///     attrs: [tokio::test, ignore = "requires a running redis server"],
///     store: RedisQueueStore::connect(REDIS_URL, namespace()).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! queue_store_test_suite {
    (for: $store:expr) => {
        $crate::queue_store_test_suite!(attrs: [tokio::test], store: $store);
    };
    (attrs: [$($attr:meta),+ $(,)?], store: $store:expr) => {
        $(#[$attr])+
        async fn enqueue_and_get() {
          let store = $store;
          $crate::store::testing::enqueue_and_get(store).await;
        }
        $(#[$attr])+
        async fn get_not_found() {
          let store = $store;
          $crate::store::testing::get_not_found(store).await;
        }
        $(#[$attr])+
        async fn enqueue_duplicate() {
          let store = $store;
          $crate::store::testing::enqueue_duplicate(store).await;
        }
        $(#[$attr])+
        async fn dequeue_empty() {
          let store = $store;
          $crate::store::testing::dequeue_empty(store).await;
        }
        $(#[$attr])+
        async fn dequeue_is_fifo() {
          let store = $store;
          $crate::store::testing::dequeue_is_fifo(store).await;
        }
        $(#[$attr])+
        async fn dequeue_prefers_due_retry() {
          let store = $store;
          $crate::store::testing::dequeue_prefers_due_retry(store).await;
        }
        $(#[$attr])+
        async fn dequeue_skips_retry_not_yet_due() {
          let store = $store;
          $crate::store::testing::dequeue_skips_retry_not_yet_due(store).await;
        }
        $(#[$attr])+
        async fn dequeue_only_one_consumer_receives_job() {
          let store = $store;
          $crate::store::testing::dequeue_only_one_consumer_receives_job(store).await;
        }
        $(#[$attr])+
        async fn update_running() {
          let store = $store;
          $crate::store::testing::update_running(store).await;
        }
        $(#[$attr])+
        async fn update_completed() {
          let store = $store;
          $crate::store::testing::update_completed(store).await;
        }
        $(#[$attr])+
        async fn update_failed() {
          let store = $store;
          $crate::store::testing::update_failed(store).await;
        }
        $(#[$attr])+
        async fn update_retrying() {
          let store = $store;
          $crate::store::testing::update_retrying(store).await;
        }
        $(#[$attr])+
        async fn update_retrying_without_due_time() {
          let store = $store;
          $crate::store::testing::update_retrying_without_due_time(store).await;
        }
        $(#[$attr])+
        async fn update_not_found() {
          let store = $store;
          $crate::store::testing::update_not_found(store).await;
        }
        $(#[$attr])+
        async fn delete() {
          let store = $store;
          $crate::store::testing::delete(store).await;
        }
        $(#[$attr])+
        async fn delete_not_found() {
          let store = $store;
          $crate::store::testing::delete_not_found(store).await;
        }
        $(#[$attr])+
        async fn recover() {
          let store = $store;
          $crate::store::testing::recover(store).await;
        }
        $(#[$attr])+
        async fn recover_claimed_retry() {
          let store = $store;
          $crate::store::testing::recover_claimed_retry(store).await;
        }
        $(#[$attr])+
        async fn recover_expired_ignores_live_locks() {
          let store = $store;
          $crate::store::testing::recover_expired_ignores_live_locks(store).await;
        }
        $(#[$attr])+
        async fn stats() {
          let store = $store;
          $crate::store::testing::stats(store).await;
        }
    };
}

#[doc(hidden)]
pub async fn enqueue_and_get(store: impl QueueStore) {
    let job = mock_job();

    let id = store.enqueue(job.clone()).await.unwrap();
    assert_eq!(id, job.id);

    let stored = store.get(id).await.unwrap();
    assert_eq!(stored.id, job.id);
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.payload, job.payload);
    assert_eq!(stored.user_id, job.user_id);
}

#[doc(hidden)]
pub async fn get_not_found(store: impl QueueStore) {
    let id = JobId::new();
    assert!(matches!(store.get(id).await, Err(StoreError::JobNotFound(missing)) if missing == id));
}

#[doc(hidden)]
pub async fn enqueue_duplicate(store: impl QueueStore) {
    let job = mock_job();
    store.enqueue(job.clone()).await.unwrap();

    assert!(matches!(
        store.enqueue(job.clone()).await,
        Err(StoreError::DuplicateJob(id)) if id == job.id
    ));

    store.dequeue().await.unwrap();
    assert!(matches!(store.dequeue().await, Err(StoreError::QueueEmpty)));
}

#[doc(hidden)]
pub async fn dequeue_empty(store: impl QueueStore) {
    assert!(matches!(store.dequeue().await, Err(StoreError::QueueEmpty)));
}

#[doc(hidden)]
pub async fn dequeue_is_fifo(store: impl QueueStore) {
    let first = store.enqueue(mock_job()).await.unwrap();
    let second = store.enqueue(mock_job()).await.unwrap();
    let third = store.enqueue(mock_job()).await.unwrap();

    assert_eq!(store.dequeue().await.unwrap().id, first);
    assert_eq!(store.dequeue().await.unwrap().id, second);
    assert_eq!(store.dequeue().await.unwrap().id, third);
    assert!(matches!(store.dequeue().await, Err(StoreError::QueueEmpty)));
}

#[doc(hidden)]
pub async fn dequeue_prefers_due_retry(store: impl QueueStore) {
    store.enqueue(mock_job()).await.unwrap();
    let mut retried = claim(&store).await;
    retried
        .set_failed_at(Utc::now() - TimeDelta::hours(1), "error", &DEFAULT_BACKOFF)
        .unwrap();
    store.update(&retried).await.unwrap();
    let pending = store.enqueue(mock_job()).await.unwrap();

    let job = store.dequeue().await.unwrap();
    assert_eq!(job.id, retried.id);
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.error.as_deref(), Some("error"));

    assert_eq!(store.dequeue().await.unwrap().id, pending);
}

#[doc(hidden)]
pub async fn dequeue_skips_retry_not_yet_due(store: impl QueueStore) {
    store.enqueue(mock_job()).await.unwrap();
    let mut job = claim(&store).await;
    job.set_failed("error").unwrap();
    store.update(&job).await.unwrap();

    assert!(matches!(store.dequeue().await, Err(StoreError::QueueEmpty)));
    assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Retrying);
}

#[doc(hidden)]
pub async fn dequeue_only_one_consumer_receives_job(store: impl QueueStore) {
    let id = store.enqueue(mock_job()).await.unwrap();

    let (first, second) = futures::join!(store.dequeue(), store.dequeue());

    let (job, empty) = match (first, second) {
        (Ok(job), empty) | (empty, Ok(job)) => (job, empty),
        results => panic!("no consumer received the job: {results:?}"),
    };
    assert_eq!(job.id, id);
    assert!(matches!(empty, Err(StoreError::QueueEmpty)));
}

#[doc(hidden)]
pub async fn update_running(store: impl QueueStore) {
    store.enqueue(mock_job()).await.unwrap();
    let job = claim(&store).await;

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Running);
    assert!(stored.started_at.is_some());

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.processing, 1);
    assert_eq!(stats.pending, 0);
    assert!(matches!(store.dequeue().await, Err(StoreError::QueueEmpty)));
}

#[doc(hidden)]
pub async fn update_completed(store: impl QueueStore) {
    store.enqueue(mock_job()).await.unwrap();
    let mut job = claim(&store).await;
    job.set_completed().unwrap();
    store.update(&job).await.unwrap();

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.completed_at.is_some());

    let stats = store.stats().await.unwrap();
    assert_eq!(
        stats,
        QueueStats {
            completed: 1,
            ..Default::default()
        }
    );
    assert_eq!(store.recover().await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn update_failed(store: impl QueueStore) {
    store.enqueue(mock_job().with_max_retries(0)).await.unwrap();
    let mut job = claim(&store).await;
    job.set_failed("fatal").unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    store.update(&job).await.unwrap();

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.error.as_deref(), Some("fatal"));

    let stats = store.stats().await.unwrap();
    assert_eq!(
        stats,
        QueueStats {
            failed: 1,
            ..Default::default()
        }
    );
    assert!(matches!(store.dequeue().await, Err(StoreError::QueueEmpty)));
}

#[doc(hidden)]
pub async fn update_retrying(store: impl QueueStore) {
    store.enqueue(mock_job()).await.unwrap();
    let mut job = claim(&store).await;
    job.set_failed("error").unwrap();
    store.update(&job).await.unwrap();

    let stored = store.get(job.id).await.unwrap();
    assert_eq!(stored.status, JobStatus::Retrying);
    assert_eq!(stored.retry_count, 1);
    assert!(stored.next_retry_at.is_some());

    let stats = store.stats().await.unwrap();
    assert_eq!(
        stats,
        QueueStats {
            retrying: 1,
            ..Default::default()
        }
    );
}

#[doc(hidden)]
pub async fn update_retrying_without_due_time(store: impl QueueStore) {
    let id = store.enqueue(mock_job()).await.unwrap();
    let mut job = store.get(id).await.unwrap();
    job.status = JobStatus::Retrying;

    assert!(matches!(
        store.update(&job).await,
        Err(StoreError::InvalidJob { id: invalid, .. }) if invalid == id
    ));
    assert_eq!(store.get(id).await.unwrap().status, JobStatus::Pending);
}

#[doc(hidden)]
pub async fn update_not_found(store: impl QueueStore) {
    let job = mock_job();
    assert!(matches!(
        store.update(&job).await,
        Err(StoreError::JobNotFound(id)) if id == job.id
    ));
    assert!(matches!(store.get(job.id).await, Err(StoreError::JobNotFound(_))));
}

#[doc(hidden)]
pub async fn delete(store: impl QueueStore) {
    store.enqueue(mock_job()).await.unwrap();
    let running = claim(&store).await;
    let pending = store.enqueue(mock_job()).await.unwrap();

    store.delete(pending).await.unwrap();
    store.delete(running.id).await.unwrap();

    assert!(matches!(store.get(pending).await, Err(StoreError::JobNotFound(_))));
    assert!(matches!(store.get(running.id).await, Err(StoreError::JobNotFound(_))));
    assert_eq!(store.stats().await.unwrap(), QueueStats::default());
    assert!(matches!(store.dequeue().await, Err(StoreError::QueueEmpty)));
    assert_eq!(store.recover().await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn delete_not_found(store: impl QueueStore) {
    let id = JobId::new();
    assert!(matches!(store.delete(id).await, Err(StoreError::JobNotFound(missing)) if missing == id));
}

#[doc(hidden)]
pub async fn recover(store: impl QueueStore) {
    let first = store.enqueue(mock_job()).await.unwrap();
    let second = store.enqueue(mock_job()).await.unwrap();
    let third = store.enqueue(mock_job()).await.unwrap();
    claim(&store).await;
    claim(&store).await;

    // Simulates a restart after a crash with two jobs in flight.
    assert_eq!(store.recover().await.unwrap(), 2);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.processing, 0);
    assert_eq!(stats.pending, 3);

    let mut recovered = vec![store.dequeue().await.unwrap(), store.dequeue().await.unwrap()];
    assert!(recovered.iter().all(|job| job.status == JobStatus::Pending));
    assert!(recovered.iter().all(|job| job.started_at.is_none()));
    recovered.sort_by_key(|job| job.id.to_string());
    let mut expected = vec![first, second];
    expected.sort_by_key(|id| id.to_string());
    assert_eq!(
        recovered.into_iter().map(|job| job.id).collect::<Vec<_>>(),
        expected
    );

    assert_eq!(store.dequeue().await.unwrap().id, third);
}

#[doc(hidden)]
pub async fn recover_claimed_retry(store: impl QueueStore) {
    store.enqueue(mock_job()).await.unwrap();
    let mut retried = claim(&store).await;
    retried
        .set_failed_at(Utc::now() - TimeDelta::hours(1), "error", &DEFAULT_BACKOFF)
        .unwrap();
    store.update(&retried).await.unwrap();

    // Claimed from the retry structure, then the worker died before recording it as running.
    let claimed = store.dequeue().await.unwrap();
    assert_eq!(claimed.id, retried.id);
    assert_eq!(claimed.status, JobStatus::Retrying);

    assert_eq!(store.recover().await.unwrap(), 1);

    let recovered = store.get(retried.id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Pending);
    assert!(recovered.next_retry_at.is_none());
    assert!(recovered.started_at.is_none());
    assert_eq!(recovered.retry_count, 1);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.retrying, 0);
    assert_eq!(stats.processing, 0);
}

#[doc(hidden)]
pub async fn recover_expired_ignores_live_locks(store: impl QueueStore) {
    store.enqueue(mock_job()).await.unwrap();
    let job = claim(&store).await;

    assert_eq!(store.recover_expired().await.unwrap(), 0);

    assert_eq!(store.get(job.id).await.unwrap().status, JobStatus::Running);
    assert_eq!(store.stats().await.unwrap().processing, 1);
}

#[doc(hidden)]
pub async fn stats(store: impl QueueStore) {
    assert_eq!(store.stats().await.unwrap(), QueueStats::default());

    for _ in 0..5 {
        store.enqueue(mock_job().with_max_retries(1)).await.unwrap();
    }
    claim(&store).await;

    let mut completed = claim(&store).await;
    completed.set_completed().unwrap();
    store.update(&completed).await.unwrap();

    let mut retrying = claim(&store).await;
    retrying.set_failed("error").unwrap();
    store.update(&retrying).await.unwrap();

    let mut failed = claim(&store).await;
    failed.retry_count = 1;
    failed.set_failed("error").unwrap();
    store.update(&failed).await.unwrap();

    assert_eq!(
        store.stats().await.unwrap(),
        QueueStats {
            pending: 1,
            processing: 1,
            retrying: 1,
            completed: 1,
            failed: 1,
        }
    );
}
