//! The queue store: durable storage of jobs and of their membership in exactly one of the
//! pending, processing, retrying, completed or failed indexes.
//!
//! All multi step operations are all-or-nothing. Implementations run them as optimistic
//! transactions and retry on conflicting concurrent writes up to
//! [`StoreConfig::max_transaction_retries`] times before giving up with [`StoreError::Conflict`].
//! A failed attempt never leaves partial state behind, so callers can always retry the whole
//! call.
use std::sync::Arc;

use async_trait::async_trait;
use chrono::TimeDelta;
use thiserror::Error;

use crate::job::{Job, JobId};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Persist the job and append its id to the pending list.
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError>;

    /// Claim the next runnable job.
    ///
    /// Retrying jobs whose due time has passed are preferred (oldest due first) over pending jobs
    /// (FIFO). The claimed id is moved into the processing set, locked until
    /// `now + processing_lock_ttl`, before the job is returned.
    ///
    /// Returns [`StoreError::QueueEmpty`] straight away when nothing is runnable.
    async fn dequeue(&self) -> Result<Job, StoreError>;

    async fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// Store the job and move it to the index matching its status.
    async fn update(&self, job: &Job) -> Result<(), StoreError>;

    /// Remove the job from every index and delete its record.
    async fn delete(&self, id: JobId) -> Result<(), StoreError>;

    /// Move every job in the processing set back to the front of the pending list.
    ///
    /// Meant to run once at startup, before any worker dequeues, to reclaim jobs orphaned by a
    /// crashed process. Returns the number of requeued jobs.
    async fn recover(&self) -> Result<usize, StoreError>;

    /// Like [`QueueStore::recover`] but only for jobs whose processing lock has expired.
    async fn recover_expired(&self) -> Result<usize, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;

    async fn close(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<T> QueueStore for Arc<T>
where
    T: QueueStore + ?Sized,
{
    async fn enqueue(&self, job: Job) -> Result<JobId, StoreError> {
        (**self).enqueue(job).await
    }
    async fn dequeue(&self) -> Result<Job, StoreError> {
        (**self).dequeue().await
    }
    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        (**self).get(id).await
    }
    async fn update(&self, job: &Job) -> Result<(), StoreError> {
        (**self).update(job).await
    }
    async fn delete(&self, id: JobId) -> Result<(), StoreError> {
        (**self).delete(id).await
    }
    async fn recover(&self) -> Result<usize, StoreError> {
        (**self).recover().await
    }
    async fn recover_expired(&self) -> Result<usize, StoreError> {
        (**self).recover_expired().await
    }
    async fn stats(&self) -> Result<QueueStats, StoreError> {
        (**self).stats().await
    }
    async fn close(&self) -> Result<(), StoreError> {
        (**self).close().await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Nothing is runnable right now. This is the steady state of an idle queue.
    #[error("Queue is empty")]
    QueueEmpty,
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} already exists")]
    DuplicateJob(JobId),
    #[error("Job {id} is invalid: {reason}")]
    InvalidJob { id: JobId, reason: &'static str },
    #[error("Transaction aborted after {0} conflicting attempts")]
    Conflict(u32),
    #[error("Store has been closed")]
    Closed,
    #[error("System in bad state")]
    BadState,
    #[error("Error encoding or decoding job")]
    Encode(#[from] serde_json::Error),
    #[error("Error communicating with the store: {0}")]
    Backend(String),
}

/// The number of jobs in each index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub retrying: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Timeouts and retention for a [`QueueStore`].
///
/// ```
/// # use flowqueue::store::StoreConfig;
/// # use chrono::TimeDelta;
/// let config = StoreConfig::default()
///     .with_processing_lock_ttl(TimeDelta::minutes(15))
///     .with_completed_ttl(TimeDelta::hours(1));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// How long a dequeued job may stay claimed before it becomes eligible for
    /// [`QueueStore::recover_expired`].
    pub processing_lock_ttl: TimeDelta,
    /// Retention of pending, processing and retrying job records.
    pub job_ttl: TimeDelta,
    /// Retention of completed job records. Failed jobs are kept indefinitely.
    pub completed_ttl: TimeDelta,
    pub max_transaction_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreConfig {
    pub const DEFAULT_PROCESSING_LOCK_TTL: TimeDelta = TimeDelta::minutes(60);
    pub const DEFAULT_JOB_TTL: TimeDelta = TimeDelta::days(7);
    pub const DEFAULT_COMPLETED_TTL: TimeDelta = TimeDelta::hours(24);
    pub const DEFAULT_MAX_TRANSACTION_RETRIES: u32 = 16;

    pub const fn new() -> Self {
        Self {
            processing_lock_ttl: Self::DEFAULT_PROCESSING_LOCK_TTL,
            job_ttl: Self::DEFAULT_JOB_TTL,
            completed_ttl: Self::DEFAULT_COMPLETED_TTL,
            max_transaction_retries: Self::DEFAULT_MAX_TRANSACTION_RETRIES,
        }
    }

    pub const fn with_processing_lock_ttl(self, ttl: TimeDelta) -> Self {
        Self {
            processing_lock_ttl: ttl,
            ..self
        }
    }

    pub const fn with_job_ttl(self, ttl: TimeDelta) -> Self {
        Self {
            job_ttl: ttl,
            ..self
        }
    }

    pub const fn with_completed_ttl(self, ttl: TimeDelta) -> Self {
        Self {
            completed_ttl: ttl,
            ..self
        }
    }

    pub const fn with_max_transaction_retries(self, retries: u32) -> Self {
        Self {
            max_transaction_retries: retries,
            ..self
        }
    }
}
