//! Workers claim jobs from a [`QueueStore`], run them through the [`HandlerRegistry`] and record
//! the outcome.
//!
//! A [`WorkerPool`] runs a fixed number of [`Worker`]s, each one an independent task polling the
//! store, together with a [`StaleJobReaper`] reclaiming jobs whose processing lock expired.
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    backoff::{Strategy, DEFAULT_BACKOFF},
    clock::{Clock, SystemClock},
    handler::{HandlerError, HandlerRegistry, JobContext},
    handlers::Collaborators,
    job::{Job, JobStatus, DEFAULT_MAX_RETRIES},
    reaper::StaleJobReaper,
    store::{QueueStore, StoreError},
};

/// What [`WorkerPool::start`] does with jobs left in the processing set by a previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartupRecovery {
    /// Requeue every processing job. Only correct when no other pool shares the store.
    #[default]
    All,
    /// Requeue only jobs whose processing lock has expired. Safe while other pools are running,
    /// for example during a rolling restart.
    Expired,
    Skip,
}

/// Configuration of a [`WorkerPool`].
///
/// ```
/// # use flowqueue::prelude::*;
/// # use chrono::TimeDelta;
/// # use std::time::Duration;
/// let config = WorkerConfig::default()
///     .with_workers(10)
///     .with_job_timeout(Duration::from_secs(60))
///     .with_backoff(BackoffStrategy::constant(TimeDelta::seconds(30)))
///     .with_startup_recovery(StartupRecovery::Expired);
/// ```
#[derive(Clone)]
pub struct WorkerConfig {
    pub workers: usize,
    /// Deadline of a single attempt.
    pub job_timeout: Duration,
    /// How long an idle worker waits before polling the store again.
    pub poll_interval: Duration,
    /// Retry budget of the follow-up jobs enqueued by the built-in handlers, see
    /// [`WorkerPool::with_default_handlers`].
    pub max_retries: u32,
    pub backoff: Arc<dyn Strategy + Send + Sync>,
    pub startup_recovery: StartupRecovery,
    /// Interval of the stale job reaper. [`None`] disables it.
    pub reaper_interval: Option<Duration>,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("workers", &self.workers)
            .field("job_timeout", &self.job_timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_retries", &self.max_retries)
            .field("startup_recovery", &self.startup_recovery)
            .field("reaper_interval", &self.reaper_interval)
            .finish_non_exhaustive()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: Self::DEFAULT_WORKERS,
            job_timeout: Self::DEFAULT_JOB_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: Arc::new(DEFAULT_BACKOFF),
            startup_recovery: StartupRecovery::default(),
            reaper_interval: Some(Self::DEFAULT_REAPER_INTERVAL),
        }
    }
}

impl WorkerConfig {
    pub const DEFAULT_WORKERS: usize = 5;
    pub const DEFAULT_JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(60);

    pub fn with_workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    pub fn with_job_timeout(self, job_timeout: Duration) -> Self {
        Self {
            job_timeout,
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_backoff(self, backoff: impl Strategy + Send + Sync + 'static) -> Self {
        Self {
            backoff: Arc::new(backoff),
            ..self
        }
    }

    pub fn with_startup_recovery(self, startup_recovery: StartupRecovery) -> Self {
        Self {
            startup_recovery,
            ..self
        }
    }

    pub fn with_reaper_interval(self, reaper_interval: Option<Duration>) -> Self {
        Self {
            reaper_interval,
            ..self
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to recover orphaned jobs on startup")]
    Recovery(#[source] StoreError),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

#[derive(Clone)]
struct JobProcessor {
    worker_id: usize,
    store: Arc<dyn QueueStore>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
}

impl JobProcessor {
    #[instrument(skip(self), fields(worker_id = self.worker_id, job_id = tracing::field::Empty))]
    async fn process_next(&self) -> Result<Option<JobStatus>, StoreError> {
        let mut job = match self.store.dequeue().await {
            Ok(job) => job,
            Err(StoreError::QueueEmpty) => return Ok(None),
            Err(err) => return Err(err),
        };
        let job_id = job.id;
        tracing::Span::current().record("job_id", tracing::field::display(&job_id));

        let started_at = self.clock.now();
        if let Err(err) = job.set_running_at(started_at) {
            tracing::error!(?err, %job_id, "Claimed job {job_id} cannot be run: {err}");
            if !job.status.is_terminal() {
                job.abandon_at(started_at, err.to_string());
            }
            if let Err(err) = self.store.update(&job).await {
                tracing::error!(?err, %job_id, "Failed to release job {job_id}: {err}");
            }
            return Ok(Some(job.status));
        }
        if let Err(err) = self.store.update(&job).await {
            tracing::error!(?err, %job_id, "Failed to mark job {job_id} as running: {err}");
        }

        tracing::debug!(%job_id, job_type = %job.job_type, attempt = job.retry_count + 1, "Executing job {job_id}");
        match self.execute(&job, started_at).await {
            Ok(()) => {
                tracing::debug!(%job_id, "Job complete {job_id}");
                if let Err(err) = job.set_completed_at(self.clock.now()) {
                    tracing::error!(?err, %job_id, "Failed to complete job {job_id}: {err}");
                }
            }
            Err(error) => self.record_failure(&mut job, error),
        }

        if let Err(err) = self.store.update(&job).await {
            tracing::error!(
                ?err,
                %job_id,
                status = %job.status,
                "Failed to record outcome of job {job_id}, it stays running until recovered: {err}",
            );
        }
        Ok(Some(job.status))
    }

    /// Runs the handler on its own task so a panic only fails this attempt.
    async fn execute(&self, job: &Job, started_at: DateTime<Utc>) -> Result<(), HandlerError> {
        let timeout = self.config.job_timeout;
        let deadline = TimeDelta::from_std(timeout)
            .ok()
            .and_then(|timeout| started_at.checked_add_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let ctx = JobContext::for_job(job, deadline);
        let payload = job.payload.clone();
        let handlers = self.handlers.clone();

        let attempt = tokio::time::timeout(timeout, async move {
            handlers.dispatch(&ctx, &payload).await
        });
        match tokio::spawn(attempt.in_current_span()).await {
            Ok(Ok(result)) => result,
            Ok(Err(_elapsed)) => Err(HandlerError::Timeout(timeout)),
            Err(error) => Err(error.into()),
        }
    }

    fn record_failure(&self, job: &mut Job, error: HandlerError) {
        let job_id = job.id;
        let now = self.clock.now();
        if let Err(err) = job.set_failed_at(now, error.to_string(), self.config.backoff.as_ref()) {
            tracing::error!(?err, %job_id, "Failed to record failure of job {job_id}: {err}");
            return;
        }
        match job.next_retry_at {
            Some(next_retry_at) => tracing::warn!(
                %job_id,
                ?error,
                retry_count = job.retry_count,
                %next_retry_at,
                "Job {job_id} failed and will be retried at {next_retry_at}: {error}",
            ),
            None => tracing::error!(
                %job_id,
                ?error,
                retry_count = job.retry_count,
                "Job {job_id} failed permanently: {error}",
            ),
        }
    }

    async fn run(self, cancellation_token: CancellationToken) {
        tracing::debug!(worker_id = self.worker_id, "Starting worker");
        loop {
            let idle = match self.process_next().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(err) => {
                    tracing::error!(?err, worker_id = self.worker_id, "Failed to dequeue job: {err}");
                    true
                }
            };
            if cancellation_token.is_cancelled() {
                break;
            }
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = cancellation_token.cancelled() => break,
                }
            }
        }
        tracing::debug!(worker_id = self.worker_id, "Shutting down worker");
    }
}

struct WorkerTask {
    cancellation_token: CancellationToken,
    handle: JoinHandle<()>,
}

/// A single polling loop.
pub struct Worker {
    processor: JobProcessor,
    task: Mutex<Option<WorkerTask>>,
}

impl Worker {
    pub fn new(
        worker_id: usize,
        store: Arc<dyn QueueStore>,
        handlers: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            processor: JobProcessor {
                worker_id,
                store,
                handlers,
                clock: Arc::new(SystemClock),
                config,
            },
            task: Mutex::new(None),
        }
    }

    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            processor: JobProcessor {
                clock: Arc::new(clock),
                ..self.processor
            },
            ..self
        }
    }

    /// Runs one iteration of the worker loop: claims the next runnable job, runs it and records
    /// the outcome.
    ///
    /// Returns the status the job ended the attempt in, or [`None`] when nothing was runnable.
    /// Only failing to claim a job is an error, every other failure is logged and recorded on
    /// the job.
    pub async fn process_next(&self) -> Result<Option<JobStatus>, StoreError> {
        self.processor.process_next().await
    }

    /// Spawns the worker loop. Does nothing if it is already running.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|err| err.into_inner());
        if task.is_some() {
            return;
        }
        let cancellation_token = CancellationToken::new();
        let handle = tokio::spawn(self.processor.clone().run(cancellation_token.clone()));
        *task = Some(WorkerTask {
            cancellation_token,
            handle,
        });
    }

    /// Stops the loop after its current iteration and waits for it to exit.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
        let Some(WorkerTask {
            cancellation_token,
            handle,
        }) = task
        else {
            return Ok(());
        };
        cancellation_token.cancel();
        handle.await.map_err(|err| {
            tracing::error!(?err, worker_id = self.processor.worker_id, "Worker loop failed: {err}");
            PoolError::GracefulShutdownFailed
        })
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

struct PoolTasks {
    workers: Vec<Worker>,
    reaper: Option<WorkerTask>,
}

/// Runs [`WorkerConfig::workers`] workers and the stale job reaper against one store.
pub struct WorkerPool {
    store: Arc<dyn QueueStore>,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    config: WorkerConfig,
    tasks: tokio::sync::Mutex<Option<PoolTasks>>,
    running: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn QueueStore>,
        handlers: Arc<HandlerRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            handlers,
            clock: Arc::new(SystemClock),
            config,
            tasks: Default::default(),
            running: AtomicBool::new(false),
        }
    }

    /// A pool running the built-in handlers.
    ///
    /// Workflow executions enqueued by the scheduled trigger handler get
    /// [`WorkerConfig::max_retries`] retries.
    pub fn with_default_handlers(
        store: Arc<dyn QueueStore>,
        collaborators: Collaborators,
        config: WorkerConfig,
    ) -> Self {
        let handlers =
            HandlerRegistry::with_default_handlers(collaborators, store.clone(), config.max_retries);
        Self::new(store, Arc::new(handlers), config)
    }

    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.handlers
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Recovers orphaned jobs according to [`WorkerConfig::startup_recovery`], then starts the
    /// workers and the reaper.
    ///
    /// If recovery fails nothing is started. Starting a running pool does nothing.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut tasks = self.tasks.lock().await;
        if tasks.is_some() {
            return Ok(());
        }

        let recovered = match self.config.startup_recovery {
            StartupRecovery::All => self.store.recover().await,
            StartupRecovery::Expired => self.store.recover_expired().await,
            StartupRecovery::Skip => Ok(0),
        }
        .map_err(|err| {
            tracing::error!(?err, "Failed to recover orphaned jobs: {err}");
            PoolError::Recovery(err)
        })?;
        if recovered > 0 {
            tracing::info!(recovered, "Recovered {recovered} orphaned jobs");
        }

        let workers: Vec<_> = (0..self.config.workers)
            .map(|worker_id| {
                Worker::new(
                    worker_id,
                    self.store.clone(),
                    self.handlers.clone(),
                    self.config.clone(),
                )
                .with_clock(self.clock.clone())
            })
            .collect();
        workers.iter().for_each(Worker::start);

        let reaper = self.config.reaper_interval.map(|interval| {
            let cancellation_token = CancellationToken::new();
            let handle =
                StaleJobReaper::new(self.store.clone(), interval).spawn(cancellation_token.clone());
            WorkerTask {
                cancellation_token,
                handle,
            }
        });

        tracing::info!(workers = workers.len(), "Started worker pool");
        *tasks = Some(PoolTasks { workers, reaper });
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Stops every worker, letting in-flight jobs finish, then the reaper.
    pub async fn stop(&self) -> Result<(), PoolError> {
        let Some(PoolTasks { workers, reaper }) = self.tasks.lock().await.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        tracing::debug!("Shutting down worker pool");

        let results = futures::future::join_all(workers.iter().map(Worker::stop)).await;
        if let Some(WorkerTask {
            cancellation_token,
            handle,
        }) = reaper
        {
            cancellation_token.cancel();
            handle.await.map_err(|err| {
                tracing::error!(?err, "Reaper task failed: {err}");
                PoolError::GracefulShutdownFailed
            })?;
        }
        results.into_iter().collect()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::AtomicUsize;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::{
        clock::MockClock,
        handler::{JobHandler, MockJobHandler},
        handlers::{
            connection_refresh::{MockConnectionRepository, MockTokenRefresher},
            scheduled_trigger::MockScheduleRepository,
            webhook::{MockWebhookClient, WebhookDeliveryHandler},
            workflow::MockWorkflowEngine,
        },
        job::{JobPayload, JobType},
        store::memory::InMemoryQueueStore,
    };

    const WAIT: Duration = Duration::from_secs(5);

    fn registry(job_type: JobType, handler: impl JobHandler + 'static) -> Arc<HandlerRegistry> {
        Arc::new(HandlerRegistry::new().with_handler(job_type, handler))
    }

    fn succeeding_handler() -> MockJobHandler {
        let mut handler = MockJobHandler::new();
        handler.expect_handle().returning(|_, _| Ok(()));
        handler
    }

    fn worker(store: &Arc<InMemoryQueueStore>, handlers: Arc<HandlerRegistry>) -> Worker {
        Worker::new(0, store.clone(), handlers, WorkerConfig::default())
    }

    async fn wait_for_status(store: &impl QueueStore, job: &Job, status: JobStatus) {
        tokio::time::timeout(WAIT, async {
            while store.get(job.id).await.unwrap().status != status {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn process_next_on_empty_queue() {
        let store = Arc::new(InMemoryQueueStore::new());
        let worker = worker(&store, Arc::new(HandlerRegistry::new()));

        assert_matches!(worker.process_next().await, Ok(None));
    }

    #[tokio::test]
    async fn process_next_completes_job() {
        let store = Arc::new(InMemoryQueueStore::new());
        let job = Job::connection_refresh("user", "connection");
        store.enqueue(job.clone()).await.unwrap();
        let worker = worker(
            &store,
            registry(JobType::ConnectionRefresh, succeeding_handler()),
        );

        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Completed)));

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.started_at.is_some());
        assert!(stored.completed_at.is_some());
        assert_eq!(store.stats().await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn process_next_schedules_retry_with_backoff() {
        let clock = MockClock::default();
        let store = Arc::new(InMemoryQueueStore::new().with_clock(clock.clone()));
        let job = Job::connection_refresh("user", "connection");
        store.enqueue(job.clone()).await.unwrap();
        let mut handler = MockJobHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Err(HandlerError::InvalidPayload("bad".to_owned())));
        let worker =
            worker(&store, registry(JobType::ConnectionRefresh, handler)).with_clock(clock.clone());

        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Retrying)));

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.error.as_deref(), Some("invalid payload: bad"));
        assert_eq!(stored.next_retry_at, Some(clock.now() + TimeDelta::minutes(1)));
        assert_matches!(worker.process_next().await, Ok(None));
    }

    #[tokio::test]
    async fn unknown_job_type_is_retried() {
        let store = Arc::new(InMemoryQueueStore::new());
        let job = Job::workflow_execution("user", "workflow", json!({}));
        store.enqueue(job.clone()).await.unwrap();
        let worker = worker(
            &store,
            registry(JobType::ConnectionRefresh, succeeding_handler()),
        );

        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Retrying)));
        let stored = store.get(job.id).await.unwrap();
        assert!(stored
            .error
            .unwrap()
            .contains("no handler registered for job type workflow_execution"));
    }

    struct PanickingHandler;

    #[async_trait]
    impl JobHandler for PanickingHandler {
        async fn handle(&self, _ctx: &JobContext, _payload: &JobPayload) -> Result<(), HandlerError> {
            panic!("connection pool exhausted")
        }
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_attempt() {
        let store = Arc::new(InMemoryQueueStore::new());
        let job = Job::connection_refresh("user", "connection");
        store.enqueue(job.clone()).await.unwrap();
        let worker = worker(&store, registry(JobType::ConnectionRefresh, PanickingHandler));

        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Retrying)));

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(
            stored.error.as_deref(),
            Some("handler panicked: connection pool exhausted")
        );
    }

    struct SlowHandler;

    #[async_trait]
    impl JobHandler for SlowHandler {
        async fn handle(&self, _ctx: &JobContext, _payload: &JobPayload) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(10 * 60)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_trigger_exceeding_deadline_is_retried() {
        let store = Arc::new(InMemoryQueueStore::new());
        let job = Job::scheduled_trigger("user", "workflow", "trigger", json!({}));
        store.enqueue(job.clone()).await.unwrap();
        let worker = worker(&store, registry(JobType::ScheduledTrigger, SlowHandler));

        let started = tokio::time::Instant::now();
        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Retrying)));
        let elapsed = started.elapsed();
        assert!(elapsed >= WorkerConfig::DEFAULT_JOB_TIMEOUT);
        assert!(elapsed < WorkerConfig::DEFAULT_JOB_TIMEOUT + Duration::from_secs(1));

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.retry_count, 1);
        assert!(stored.error.unwrap().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn webhook_recovers_after_three_server_errors() {
        let clock = MockClock::default();
        let store = Arc::new(InMemoryQueueStore::new().with_clock(clock.clone()));
        let job = Job::webhook_delivery(
            "user",
            "https://example.com/hook",
            json!({"event": "created"}),
            Default::default(),
        );
        store.enqueue(job.clone()).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let mut client = MockWebhookClient::new();
        client.expect_post().times(4).returning({
            let calls = calls.clone();
            move |_, _, _| match calls.fetch_add(1, Ordering::SeqCst) {
                0..=2 => Ok(500),
                _ => Ok(200),
            }
        });
        let worker = worker(
            &store,
            registry(
                JobType::WebhookDelivery,
                WebhookDeliveryHandler::new(Arc::new(client)),
            ),
        )
        .with_clock(clock.clone());

        for backoff in [1, 2, 4] {
            assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Retrying)));
            assert_matches!(worker.process_next().await, Ok(None));
            clock.advance(TimeDelta::minutes(backoff));
        }
        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Completed)));

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_permanently() {
        let clock = MockClock::default();
        let store = Arc::new(InMemoryQueueStore::new().with_clock(clock.clone()));
        let job = Job::connection_refresh("user", "connection").with_max_retries(1);
        store.enqueue(job.clone()).await.unwrap();
        let mut handler = MockJobHandler::new();
        handler
            .expect_handle()
            .times(2)
            .returning(|_, _| Err(HandlerError::UnexpectedStatus(503)));
        let worker =
            worker(&store, registry(JobType::ConnectionRefresh, handler)).with_clock(clock.clone());

        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Retrying)));
        clock.advance(TimeDelta::minutes(1));
        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Failed)));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retrying, 0);
    }

    #[tokio::test]
    async fn saturated_backoff_keeps_the_worker_alive() {
        let store = Arc::new(InMemoryQueueStore::new());
        let mut job = Job::connection_refresh("user", "connection").with_max_retries(100);
        job.retry_count = 40;
        store.enqueue(job.clone()).await.unwrap();
        let mut handler = MockJobHandler::new();
        handler
            .expect_handle()
            .returning(|_, _| Err(HandlerError::UnexpectedStatus(500)));
        let worker = worker(&store, registry(JobType::ConnectionRefresh, handler));

        let outcome = tokio::spawn(async move { worker.process_next().await })
            .await
            .unwrap();
        assert_matches!(outcome, Ok(Some(JobStatus::Retrying)));

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.retry_count, 41);
        assert!(stored.next_retry_at.unwrap() > Utc::now() + TimeDelta::days(365 * 1000));
        assert_eq!(store.stats().await.unwrap().processing, 0);
    }

    #[tokio::test]
    async fn unrunnable_job_is_failed_instead_of_left_claimed() {
        let store = Arc::new(InMemoryQueueStore::new());
        let mut job = Job::connection_refresh("user", "connection");
        job.set_running().unwrap();
        store.enqueue(job.clone()).await.unwrap();
        let mut handler = MockJobHandler::new();
        handler.expect_handle().never();
        let worker = worker(&store, registry(JobType::ConnectionRefresh, handler));

        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Failed)));

        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.error.unwrap().contains("cannot move from running to running"));
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.failed, 1);
        assert_eq!(store.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn terminal_job_in_queue_is_released() {
        let store = Arc::new(InMemoryQueueStore::new());
        let mut job = Job::connection_refresh("user", "connection");
        job.set_running().unwrap();
        job.set_completed().unwrap();
        store.enqueue(job.clone()).await.unwrap();
        let worker = worker(&store, Arc::new(HandlerRegistry::new()));

        assert_matches!(worker.process_next().await, Ok(Some(JobStatus::Completed)));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.completed, 1);
    }

    #[tokio::test]
    async fn default_handlers_use_configured_retry_budget() {
        let store = Arc::new(InMemoryQueueStore::new());
        let mut schedules = MockScheduleRepository::new();
        schedules.expect_record_fire().returning(|_, _, _| Ok(()));
        let collaborators = Collaborators {
            workflow_engine: Arc::new(MockWorkflowEngine::new()),
            webhook_client: Arc::new(MockWebhookClient::new()),
            schedules: Arc::new(schedules),
            connections: Arc::new(MockConnectionRepository::new()),
            token_refresher: Arc::new(MockTokenRefresher::new()),
        };
        let pool = WorkerPool::with_default_handlers(
            store.clone(),
            collaborators,
            WorkerConfig::default().with_max_retries(7),
        );
        let trigger = Job::scheduled_trigger("user", "workflow", "trigger", json!({}));

        pool.handlers()
            .dispatch(&JobContext::for_job(&trigger, Utc::now()), &trigger.payload)
            .await
            .unwrap();

        let execution = store.dequeue().await.unwrap();
        assert_eq!(execution.job_type, JobType::WorkflowExecution);
        assert_eq!(execution.max_retries, 7);
    }

    #[tokio::test]
    async fn process_next_surfaces_store_errors() {
        let store = Arc::new(InMemoryQueueStore::new());
        store.close().await.unwrap();
        let worker = worker(&store, Arc::new(HandlerRegistry::new()));

        assert_matches!(worker.process_next().await, Err(StoreError::Closed));
    }

    #[tokio::test]
    async fn worker_start_and_stop() {
        let store = Arc::new(InMemoryQueueStore::new());
        let job = Job::connection_refresh("user", "connection");
        store.enqueue(job.clone()).await.unwrap();
        let worker = Worker::new(
            0,
            store.clone(),
            registry(JobType::ConnectionRefresh, succeeding_handler()),
            WorkerConfig::default().with_poll_interval(Duration::from_millis(10)),
        );

        worker.start();
        worker.start();
        assert!(worker.is_running());
        wait_for_status(&*store, &job, JobStatus::Completed).await;

        worker.stop().await.unwrap();
        assert!(!worker.is_running());
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pool_recovers_orphaned_jobs_on_start() {
        let store = Arc::new(InMemoryQueueStore::new());
        let job = Job::connection_refresh("user", "connection");
        store.enqueue(job.clone()).await.unwrap();
        // A previous process claimed the job and crashed.
        let mut orphan = store.dequeue().await.unwrap();
        orphan.set_running().unwrap();
        store.update(&orphan).await.unwrap();

        let pool = WorkerPool::new(
            store.clone(),
            registry(JobType::ConnectionRefresh, succeeding_handler()),
            WorkerConfig::default()
                .with_workers(2)
                .with_poll_interval(Duration::from_millis(10)),
        );
        pool.start().await.unwrap();
        assert!(pool.is_running());

        wait_for_status(&*store, &job, JobStatus::Completed).await;
        pool.stop().await.unwrap();
        assert!(!pool.is_running());
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pool_skips_recovery_when_configured() {
        let store = Arc::new(InMemoryQueueStore::new());
        store
            .enqueue(Job::connection_refresh("user", "connection"))
            .await
            .unwrap();
        store.dequeue().await.unwrap();

        let pool = WorkerPool::new(
            store.clone(),
            Arc::new(HandlerRegistry::new()),
            WorkerConfig::default()
                .with_startup_recovery(StartupRecovery::Skip)
                .with_reaper_interval(None),
        );
        pool.start().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.pending, 0);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pool_does_not_start_when_recovery_fails() {
        let store = Arc::new(InMemoryQueueStore::new());
        store.close().await.unwrap();
        let pool = WorkerPool::new(
            store,
            Arc::new(HandlerRegistry::new()),
            WorkerConfig::default(),
        );

        assert_matches!(
            pool.start().await,
            Err(PoolError::Recovery(StoreError::Closed))
        );
        assert!(!pool.is_running());
    }
}
