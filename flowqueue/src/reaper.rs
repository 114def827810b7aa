//! Periodic reclaiming of jobs whose processing lock expired, for example because the worker
//! holding them crashed.
use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::QueueStore;

pub struct StaleJobReaper {
    store: Arc<dyn QueueStore>,
    interval: Duration,
}

impl StaleJobReaper {
    pub fn new(store: Arc<dyn QueueStore>, interval: Duration) -> Self {
        Self { store, interval }
    }

    /// Requeues expired jobs once, returning how many were reclaimed. Errors are logged.
    pub async fn reap(&self) -> usize {
        match self.store.recover_expired().await {
            Ok(0) => 0,
            Ok(recovered) => {
                tracing::warn!(recovered, "Reclaimed {recovered} jobs with expired processing locks");
                recovered
            }
            Err(err) => {
                tracing::error!(?err, "Failed to reclaim stale jobs: {err}");
                0
            }
        }
    }

    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.interval) => {
                        self.reap().await;
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the stale job reaper");
                        break;
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;

    use super::*;
    use crate::{
        clock::MockClock,
        job::Job,
        store::{memory::InMemoryQueueStore, StoreConfig},
    };

    fn store(clock: &MockClock) -> Arc<InMemoryQueueStore> {
        Arc::new(
            InMemoryQueueStore::new()
                .with_clock(clock.clone())
                .with_config(
                    StoreConfig::default().with_processing_lock_ttl(TimeDelta::minutes(10)),
                ),
        )
    }

    #[tokio::test]
    async fn reap_requeues_only_expired_jobs() {
        let clock = MockClock::default();
        let store = store(&clock);
        store
            .enqueue(Job::connection_refresh("user", "connection"))
            .await
            .unwrap();
        store.dequeue().await.unwrap();
        let reaper = StaleJobReaper::new(store.clone(), Duration::from_secs(60));

        assert_eq!(reaper.reap().await, 0);
        clock.advance(TimeDelta::minutes(10));
        assert_eq!(reaper.reap().await, 1);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 0);
    }

    #[tokio::test]
    async fn reap_logs_store_errors() {
        let store = Arc::new(InMemoryQueueStore::new());
        store.close().await.unwrap();

        assert_eq!(
            StaleJobReaper::new(store, Duration::from_secs(60))
                .reap()
                .await,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_reaper_runs_until_cancelled() {
        let clock = MockClock::default();
        let store = store(&clock);
        store
            .enqueue(Job::connection_refresh("user", "connection"))
            .await
            .unwrap();
        store.dequeue().await.unwrap();
        clock.advance(TimeDelta::minutes(11));

        let cancellation_token = CancellationToken::new();
        let handle = StaleJobReaper::new(store.clone(), Duration::from_secs(60))
            .spawn(cancellation_token.clone());
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert_eq!(store.stats().await.unwrap().pending, 1);
        cancellation_token.cancel();
        handle.await.unwrap();
    }
}
