//! The unit of deferred work and its state machine.
//!
//! A [`Job`] is created by whoever wants work done later (an API handler, the scheduler, or
//! another job's handler), persisted via [`crate::store::QueueStore::enqueue`], and from then on
//! only mutated by a worker through [`Job::set_running`], [`Job::set_completed`] and
//! [`Job::set_failed`].
//!
//! ```text
//! Pending -> Running -> Completed
//!                    -> Retrying -> (due) -> Running -> ...
//!                    -> Failed
//! ```
use std::{collections::HashMap, fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backoff::{Strategy, DEFAULT_BACKOFF};

/// The default number of retries a job gets before it is marked as [`JobStatus::Failed`].
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique identifier of a job.
///
/// Backed by a random (v4) UUID so ids can be generated concurrently on any number of processes
/// without coordination.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The kind of work a job represents. Each type has exactly one handler.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    WorkflowExecution,
    WebhookDelivery,
    ScheduledTrigger,
    ConnectionRefresh,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        Self::WorkflowExecution,
        Self::WebhookDelivery,
        Self::ScheduledTrigger,
        Self::ConnectionRefresh,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowExecution => "workflow_execution",
            Self::WebhookDelivery => "webhook_delivery",
            Self::ScheduledTrigger => "scheduled_trigger",
            Self::ConnectionRefresh => "connection_refresh",
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Retrying,
}

impl JobStatus {
    /// Completed and failed jobs are never picked up again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        f.write_str(status)
    }
}

/// The data a handler needs to perform a job, one variant per [`JobType`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    WorkflowExecution {
        workflow_id: String,
        trigger_data: serde_json::Value,
    },
    WebhookDelivery {
        url: String,
        body: serde_json::Value,
        #[serde(default)]
        headers: HashMap<String, String>,
    },
    ScheduledTrigger {
        workflow_id: String,
        trigger_id: String,
        trigger_config: serde_json::Value,
    },
    ConnectionRefresh {
        connection_id: String,
    },
}

impl JobPayload {
    pub fn job_type(&self) -> JobType {
        match self {
            Self::WorkflowExecution { .. } => JobType::WorkflowExecution,
            Self::WebhookDelivery { .. } => JobType::WebhookDelivery,
            Self::ScheduledTrigger { .. } => JobType::ScheduledTrigger,
            Self::ConnectionRefresh { .. } => JobType::ConnectionRefresh,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// A durable unit of deferred work.
///
/// The copy held by a worker is a working copy; changes only become visible to others once it has
/// been written back with [`crate::store::QueueStore::update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub user_id: String,
    pub payload: JobPayload,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Creates a new [`JobStatus::Pending`] job for the given payload.
    pub fn new(user_id: impl Into<String>, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: payload.job_type(),
            status: JobStatus::Pending,
            user_id: user_id.into(),
            payload,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
        }
    }

    pub fn workflow_execution(
        user_id: impl Into<String>,
        workflow_id: impl Into<String>,
        trigger_data: serde_json::Value,
    ) -> Self {
        Self::new(
            user_id,
            JobPayload::WorkflowExecution {
                workflow_id: workflow_id.into(),
                trigger_data,
            },
        )
    }

    pub fn webhook_delivery(
        user_id: impl Into<String>,
        url: impl Into<String>,
        body: serde_json::Value,
        headers: HashMap<String, String>,
    ) -> Self {
        Self::new(
            user_id,
            JobPayload::WebhookDelivery {
                url: url.into(),
                body,
                headers,
            },
        )
    }

    pub fn scheduled_trigger(
        user_id: impl Into<String>,
        workflow_id: impl Into<String>,
        trigger_id: impl Into<String>,
        trigger_config: serde_json::Value,
    ) -> Self {
        Self::new(
            user_id,
            JobPayload::ScheduledTrigger {
                workflow_id: workflow_id.into(),
                trigger_id: trigger_id.into(),
                trigger_config,
            },
        )
    }

    pub fn connection_refresh(
        user_id: impl Into<String>,
        connection_id: impl Into<String>,
    ) -> Self {
        Self::new(
            user_id,
            JobPayload::ConnectionRefresh {
                connection_id: connection_id.into(),
            },
        )
    }

    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Whether a worker may pick this job up at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending => true,
            JobStatus::Retrying => self.next_retry_at.is_some_and(|due| now >= due),
            _ => false,
        }
    }

    pub fn set_running(&mut self) -> Result<(), JobError> {
        self.set_running_at(Utc::now())
    }

    /// Marks the job as [`JobStatus::Running`].
    ///
    /// Accepted from [`JobStatus::Pending`] and [`JobStatus::Retrying`]. The store only hands out
    /// retrying jobs once their due time has passed, so the due time is not checked again here.
    pub fn set_running_at(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        match self.status {
            JobStatus::Pending | JobStatus::Retrying => {
                self.status = JobStatus::Running;
                self.started_at = Some(now);
                self.next_retry_at = None;
                self.updated_at = now;
                Ok(())
            }
            from => Err(self.invalid_transition(from, JobStatus::Running)),
        }
    }

    pub fn set_completed(&mut self) -> Result<(), JobError> {
        self.set_completed_at(Utc::now())
    }

    pub fn set_completed_at(&mut self, now: DateTime<Utc>) -> Result<(), JobError> {
        match self.status {
            JobStatus::Running => {
                self.status = JobStatus::Completed;
                self.completed_at = Some(now);
                self.updated_at = now;
                Ok(())
            }
            from => Err(self.invalid_transition(from, JobStatus::Completed)),
        }
    }

    /// Records a failed attempt using [`DEFAULT_BACKOFF`].
    pub fn set_failed(&mut self, error: impl Into<String>) -> Result<(), JobError> {
        self.set_failed_at(Utc::now(), error, &DEFAULT_BACKOFF)
    }

    /// Records a failed attempt.
    ///
    /// While retries remain the job moves to [`JobStatus::Retrying`] with `next_retry_at` set
    /// according to `backoff`, otherwise it is permanently [`JobStatus::Failed`]. The error is
    /// recorded in both cases.
    pub fn set_failed_at(
        &mut self,
        now: DateTime<Utc>,
        error: impl Into<String>,
        backoff: &(impl Strategy + ?Sized),
    ) -> Result<(), JobError> {
        if self.status != JobStatus::Running {
            return Err(self.invalid_transition(self.status, JobStatus::Failed));
        }
        self.error = Some(error.into());
        self.updated_at = now;
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = JobStatus::Retrying;
            let due = now
                .checked_add_signed(backoff.backoff(self.retry_count))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.next_retry_at = Some(due);
        } else {
            self.status = JobStatus::Failed;
            self.completed_at = Some(now);
            self.next_retry_at = None;
        }
        Ok(())
    }

    /// Permanently fails a job that cannot be run, whatever state it is in.
    pub fn abandon_at(&mut self, now: DateTime<Utc>, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(now);
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Puts a job that was orphaned in the processing set back into the pending state.
    ///
    /// Only meant for [`QueueStore::recover`](crate::store::QueueStore::recover) implementations.
    pub fn reset_to_pending(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.started_at = None;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    fn invalid_transition(&self, from: JobStatus, to: JobStatus) -> JobError {
        JobError::InvalidTransition {
            id: self.id,
            from,
            to,
        }
    }
}
