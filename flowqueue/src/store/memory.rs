//! Provides an in memory implementation of [`QueueStore`].
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in tests
//! and single process deployments. Every operation runs as an optimistic transaction: a snapshot
//! of the state is taken together with its version, the operation is applied to the snapshot and
//! the result is only committed if nobody else committed in the meantime.
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{QueueStats, QueueStore, StoreConfig, StoreError};
use crate::{
    clock::{Clock, SystemClock},
    job::{Job, JobId, JobStatus},
};

/// An in memory implementation of [`QueueStore`].
///
/// Clones share the same underlying queue.
#[derive(Clone)]
pub struct InMemoryQueueStore {
    inner: Arc<RwLock<Versioned>>,
    clock: Arc<dyn Clock>,
    config: StoreConfig,
    closed: Arc<AtomicBool>,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct Versioned {
    version: u64,
    state: State,
}

#[derive(Clone)]
struct Record {
    data: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Record {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires_at| expires_at > now)
    }

    fn decode(&self) -> Result<Job, StoreError> {
        Ok(serde_json::from_str(&self.data)?)
    }
}

#[derive(Clone, Default)]
struct State {
    records: HashMap<JobId, Record>,
    pending: VecDeque<JobId>,
    /// Claimed jobs and the time their processing lock expires.
    processing: HashMap<JobId, DateTime<Utc>>,
    /// Jobs awaiting a retry, ordered by due time.
    retrying: BTreeSet<(DateTime<Utc>, JobId)>,
    /// Completed jobs and the time their record expires.
    completed: HashMap<JobId, DateTime<Utc>>,
    failed: HashSet<JobId>,
}

impl State {
    fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.records.retain(|_, record| record.is_live(now));
        let records = &self.records;
        self.pending.retain(|id| records.contains_key(id));
        self.processing.retain(|id, _| records.contains_key(id));
        self.retrying.retain(|(_, id)| records.contains_key(id));
        self.completed
            .retain(|id, expires_at| *expires_at > now && records.contains_key(id));
        self.failed.retain(|id| records.contains_key(id));
    }

    fn next_runnable(&mut self, now: DateTime<Utc>) -> Option<JobId> {
        match self.retrying.first().copied() {
            Some(entry @ (due, id)) if due <= now => {
                self.retrying.remove(&entry);
                Some(id)
            }
            _ => self.pending.pop_front(),
        }
    }

    fn remove_from_indexes(&mut self, id: JobId) -> Option<DateTime<Utc>> {
        let lock = self.processing.remove(&id);
        self.retrying.retain(|(_, other)| *other != id);
        self.completed.remove(&id);
        self.failed.remove(&id);
        lock
    }

    fn requeue_claimed(
        &mut self,
        now: DateTime<Utc>,
        job_ttl: chrono::TimeDelta,
        expired_only: bool,
    ) -> Result<usize, StoreError> {
        let mut claimed: Vec<_> = self
            .processing
            .iter()
            .filter(|(_, locked_until)| !expired_only || **locked_until <= now)
            .map(|(id, locked_until)| (*locked_until, *id))
            .collect();
        claimed.sort();

        // Pushed to the front in reverse so the longest claimed job ends up first.
        for (_, id) in claimed.iter().rev() {
            self.processing.remove(id);
            let record = self.records.get_mut(id).ok_or(StoreError::BadState)?;
            let mut job = record.decode()?;
            job.reset_to_pending(now);
            *record = Record {
                data: serde_json::to_string(&job)?,
                expires_at: Some(now + job_ttl),
            };
            self.pending.retain(|other| other != id);
            self.pending.push_front(*id);
        }
        Ok(claimed.len())
    }
}

impl InMemoryQueueStore {
    /// Creates a new instance of [`InMemoryQueueStore`] using the [`StoreConfig::default`]
    /// configuration and the system clock.
    pub fn new() -> Self {
        Self {
            inner: Default::default(),
            clock: Arc::new(SystemClock),
            config: StoreConfig::default(),
            closed: Default::default(),
        }
    }

    pub fn with_config(self, config: StoreConfig) -> Self {
        Self { config, ..self }
    }

    /// Read the time from the given clock instead of the system clock.
    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    /// Runs `operation` against a snapshot of the state and commits it if no other transaction
    /// committed in the meantime. An error from `operation` discards the snapshot.
    fn transaction<T>(
        &self,
        mut operation: impl FnMut(&mut State, DateTime<Utc>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        self.ensure_open()?;
        let attempts = self.config.max_transaction_retries.max(1);
        for attempt in 1..=attempts {
            let (version, mut state) = {
                let inner = self.inner.read().map_err(|_| StoreError::BadState)?;
                (inner.version, inner.state.clone())
            };
            let now = self.clock.now();
            state.purge_expired(now);
            let result = operation(&mut state, now)?;

            let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
            if inner.version == version {
                inner.state = state;
                inner.version += 1;
                return Ok(result);
            }
            tracing::trace!(attempt, "Transaction conflicted, retrying");
        }
        Err(StoreError::Conflict(attempts))
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError> {
        let id = job.id;
        let data = serde_json::to_string(&job)?;
        let job_ttl = self.config.job_ttl;
        self.transaction(|state, now| {
            if state.records.contains_key(&id) {
                return Err(StoreError::DuplicateJob(id));
            }
            state.records.insert(
                id,
                Record {
                    data: data.clone(),
                    expires_at: Some(now + job_ttl),
                },
            );
            state.pending.push_back(id);
            Ok(id)
        })
    }

    async fn dequeue(&self) -> Result<Job, StoreError> {
        let lock_ttl = self.config.processing_lock_ttl;
        self.transaction(|state, now| {
            let id = state.next_runnable(now).ok_or(StoreError::QueueEmpty)?;
            state.processing.insert(id, now + lock_ttl);
            state
                .records
                .get(&id)
                .ok_or(StoreError::BadState)?
                .decode()
        })
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now();
        let inner = self.inner.read().map_err(|_| StoreError::BadState)?;
        match inner.state.records.get(&id) {
            Some(record) if record.is_live(now) => record.decode(),
            _ => Err(StoreError::JobNotFound(id)),
        }
    }

    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        if job.status == JobStatus::Retrying && job.next_retry_at.is_none() {
            return Err(StoreError::InvalidJob {
                id: job.id,
                reason: "retrying job without a next retry time",
            });
        }
        let data = serde_json::to_string(job)?;
        let StoreConfig {
            processing_lock_ttl,
            job_ttl,
            completed_ttl,
            ..
        } = self.config;

        self.transaction(|state, now| {
            if !state.records.contains_key(&job.id) {
                return Err(StoreError::JobNotFound(job.id));
            }
            let expires_at = match job.status {
                JobStatus::Completed => Some(now + completed_ttl),
                JobStatus::Failed => None,
                _ => Some(now + job_ttl),
            };
            state.records.insert(
                job.id,
                Record {
                    data: data.clone(),
                    expires_at,
                },
            );

            let lock = state.remove_from_indexes(job.id);
            if job.status != JobStatus::Pending {
                state.pending.retain(|other| *other != job.id);
            }
            match job.status {
                JobStatus::Pending => {
                    if !state.pending.contains(&job.id) {
                        state.pending.push_back(job.id);
                    }
                }
                JobStatus::Running => {
                    state
                        .processing
                        .insert(job.id, lock.unwrap_or(now + processing_lock_ttl));
                }
                JobStatus::Retrying => {
                    if let Some(due) = job.next_retry_at {
                        state.retrying.insert((due, job.id));
                    }
                }
                JobStatus::Completed => {
                    state.completed.insert(job.id, now + completed_ttl);
                }
                JobStatus::Failed => {
                    state.failed.insert(job.id);
                }
            }
            Ok(())
        })
    }

    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        self.transaction(|state, _now| {
            state.records.remove(&id).ok_or(StoreError::JobNotFound(id))?;
            state.remove_from_indexes(id);
            state.pending.retain(|other| *other != id);
            Ok(())
        })
    }

    async fn recover(&self) -> Result<usize, StoreError> {
        let job_ttl = self.config.job_ttl;
        self.transaction(|state, now| state.requeue_claimed(now, job_ttl, false))
    }

    async fn recover_expired(&self) -> Result<usize, StoreError> {
        let job_ttl = self.config.job_ttl;
        self.transaction(|state, now| state.requeue_claimed(now, job_ttl, true))
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        self.transaction(|state, _now| {
            Ok(QueueStats {
                pending: state.pending.len(),
                processing: state.processing.len(),
                retrying: state.retrying.len(),
                completed: state.completed.len(),
                failed: state.failed.len(),
            })
        })
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
