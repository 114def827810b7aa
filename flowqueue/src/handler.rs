//! Dispatch of claimed jobs to the code that performs them.
//!
//! Every [`JobType`] maps to one [`JobHandler`] in a [`HandlerRegistry`]. The registry is built
//! once, handed to the worker pool and never mutated afterwards.
use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::task::JoinError;

use crate::{
    handlers::{
        connection_refresh::ConnectionRefreshHandler, scheduled_trigger::ScheduledTriggerHandler,
        webhook::WebhookDeliveryHandler, workflow::WorkflowExecutionHandler, Collaborators,
    },
    job::{Job, JobId, JobPayload, JobType},
    store::{QueueStore, StoreError},
};

/// Error type returned by collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// What a handler knows about the job it is running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub job_id: JobId,
    pub user_id: String,
    pub job_type: JobType,
    /// Number of failed attempts before this one.
    pub retry_count: u32,
    /// The attempt is abandoned with [`HandlerError::Timeout`] after this point.
    pub deadline: DateTime<Utc>,
}

impl JobContext {
    pub fn for_job(job: &Job, deadline: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            user_id: job.user_id.clone(),
            job_type: job.job_type,
            retry_count: job.retry_count,
            deadline,
        }
    }
}

/// Performs one attempt of a job.
///
/// Jobs are delivered at least once, so implementations have to be idempotent.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<(), HandlerError>;
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("deadline exceeded: job did not complete within {0:?}")]
    Timeout(Duration),
    #[error("handler panicked: {0}")]
    Panic(String),
    #[error("no handler registered for job type {0}")]
    UnknownJobType(JobType),
    #[error("payload does not match job type {0}")]
    PayloadMismatch(JobType),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("unexpected response status {0}")]
    UnexpectedStatus(u16),
    #[error("failed to enqueue follow-up job: {0}")]
    Enqueue(#[from] StoreError),
    #[error(transparent)]
    Collaborator(BoxError),
}

impl From<JoinError> for HandlerError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self::Panic(message)
    }
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in handler for every [`JobType`].
    ///
    /// `store` and `max_retries` are used by the scheduled trigger handler to enqueue the
    /// workflow executions it fires.
    pub fn with_default_handlers(
        collaborators: Collaborators,
        store: Arc<dyn QueueStore>,
        max_retries: u32,
    ) -> Self {
        let Collaborators {
            workflow_engine,
            webhook_client,
            schedules,
            connections,
            token_refresher,
        } = collaborators;

        Self::new()
            .with_handler(
                JobType::WorkflowExecution,
                WorkflowExecutionHandler::new(workflow_engine),
            )
            .with_handler(
                JobType::WebhookDelivery,
                WebhookDeliveryHandler::new(webhook_client),
            )
            .with_handler(
                JobType::ScheduledTrigger,
                ScheduledTriggerHandler::new(store, schedules).with_max_retries(max_retries),
            )
            .with_handler(
                JobType::ConnectionRefresh,
                ConnectionRefreshHandler::new(connections, token_refresher),
            )
    }

    /// Registers `handler` for `job_type`, returning the handler it replaced.
    pub fn register(
        &mut self,
        job_type: JobType,
        handler: impl JobHandler + 'static,
    ) -> Option<Arc<dyn JobHandler>> {
        self.handlers.insert(job_type, Arc::new(handler))
    }

    pub fn with_handler(mut self, job_type: JobType, handler: impl JobHandler + 'static) -> Self {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    pub async fn dispatch(&self, ctx: &JobContext, payload: &JobPayload) -> Result<(), HandlerError> {
        let handler = self
            .get(ctx.job_type)
            .ok_or(HandlerError::UnknownJobType(ctx.job_type))?;
        if payload.job_type() != ctx.job_type {
            return Err(HandlerError::PayloadMismatch(ctx.job_type));
        }
        handler.handle(ctx, payload).await
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use mockall::predicate::eq;

    use super::*;

    fn context(job: &Job) -> JobContext {
        JobContext::for_job(job, Utc::now())
    }

    #[tokio::test]
    async fn dispatch_routes_to_registered_handler() {
        let job = Job::connection_refresh("user", "connection");
        let ctx = context(&job);

        let mut handler = MockJobHandler::new();
        handler
            .expect_handle()
            .with(eq(ctx.clone()), eq(job.payload.clone()))
            .times(1)
            .returning(|_, _| Ok(()));
        let registry = HandlerRegistry::new().with_handler(JobType::ConnectionRefresh, handler);

        registry.dispatch(&ctx, &job.payload).await.unwrap();
    }

    #[tokio::test]
    async fn dispatch_unknown_job_type() {
        let job = Job::connection_refresh("user", "connection");

        let result = HandlerRegistry::new()
            .dispatch(&context(&job), &job.payload)
            .await;

        assert_matches!(
            result,
            Err(HandlerError::UnknownJobType(JobType::ConnectionRefresh))
        );
    }

    #[tokio::test]
    async fn dispatch_payload_mismatch() {
        let job = Job::connection_refresh("user", "connection");
        let mut ctx = context(&job);
        ctx.job_type = JobType::WorkflowExecution;

        let mut handler = MockJobHandler::new();
        handler.expect_handle().never();
        let registry = HandlerRegistry::new().with_handler(JobType::WorkflowExecution, handler);

        assert_matches!(
            registry.dispatch(&ctx, &job.payload).await,
            Err(HandlerError::PayloadMismatch(JobType::WorkflowExecution))
        );
    }

    #[test]
    fn register_replaces_existing_handler() {
        let mut registry = HandlerRegistry::new();
        assert!(registry
            .register(JobType::WebhookDelivery, MockJobHandler::new())
            .is_none());
        assert!(registry
            .register(JobType::WebhookDelivery, MockJobHandler::new())
            .is_some());
        assert!(registry.get(JobType::WebhookDelivery).is_some());
        assert!(registry.get(JobType::ScheduledTrigger).is_none());
    }

    #[tokio::test]
    async fn join_error_becomes_panic_message() {
        let error: HandlerError = tokio::spawn(async { panic!("handler blew up") })
            .await
            .unwrap_err()
            .into();

        assert_matches!(error, HandlerError::Panic(message) if message == "handler blew up");
    }

    #[test]
    fn timeout_message_mentions_deadline() {
        let error = HandlerError::Timeout(Duration::from_secs(300));
        assert!(error.to_string().contains("deadline exceeded"));
    }
}
