use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::json;

use crate::{
    clock::{Clock, SystemClock},
    handler::{BoxError, HandlerError, JobContext, JobHandler},
    job::{Job, JobPayload, JobType, DEFAULT_MAX_RETRIES},
    store::QueueStore,
};

/// Persistence of trigger bookkeeping.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn record_fire(
        &self,
        trigger_id: &str,
        last_triggered_at: DateTime<Utc>,
        next_trigger_at: Option<DateTime<Utc>>,
    ) -> Result<(), BoxError>;
}

/// Fires [`JobPayload::ScheduledTrigger`] jobs.
///
/// Firing enqueues a workflow execution for the trigger's workflow and records the fire time,
/// together with the next one when the trigger config carries a `cron` expression.
pub struct ScheduledTriggerHandler {
    store: Arc<dyn QueueStore>,
    schedules: Arc<dyn ScheduleRepository>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
}

impl ScheduledTriggerHandler {
    pub fn new(store: Arc<dyn QueueStore>, schedules: Arc<dyn ScheduleRepository>) -> Self {
        Self {
            store,
            schedules,
            clock: Arc::new(SystemClock),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// The retry budget of the workflow executions this handler enqueues.
    pub fn with_max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    pub fn with_clock(self, clock: impl Clock + 'static) -> Self {
        Self {
            clock: Arc::new(clock),
            ..self
        }
    }
}

/// The first fire time strictly after `after`, if the config has a `cron` schedule.
fn next_fire_time(
    trigger_config: &serde_json::Value,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, HandlerError> {
    let Some(expression) = trigger_config.get("cron") else {
        return Ok(None);
    };
    let expression = expression.as_str().ok_or_else(|| {
        HandlerError::InvalidPayload(format!("cron expression must be a string: {expression}"))
    })?;
    let schedule = Schedule::from_str(expression).map_err(|err| {
        HandlerError::InvalidPayload(format!("invalid cron expression {expression:?}: {err}"))
    })?;
    Ok(schedule.after(&after).next())
}

#[async_trait]
impl JobHandler for ScheduledTriggerHandler {
    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<(), HandlerError> {
        let JobPayload::ScheduledTrigger {
            workflow_id,
            trigger_id,
            trigger_config,
        } = payload
        else {
            return Err(HandlerError::PayloadMismatch(JobType::ScheduledTrigger));
        };

        let fired_at = self.clock.now();
        let next_trigger_at = next_fire_time(trigger_config, fired_at)?;

        let execution = Job::workflow_execution(
            ctx.user_id.as_str(),
            workflow_id.as_str(),
            json!({
                "trigger_id": trigger_id,
                "fired_at": fired_at,
                "config": trigger_config,
            }),
        )
        .with_max_retries(self.max_retries);
        let execution_id = self.store.enqueue(execution).await?;

        self.schedules
            .record_fire(trigger_id, fired_at, next_trigger_at)
            .await
            .map_err(HandlerError::Collaborator)?;

        tracing::debug!(
            job_id = %ctx.job_id,
            %trigger_id,
            %execution_id,
            ?next_trigger_at,
            "Fired trigger {trigger_id}",
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::TimeZone;
    use mockall::predicate::eq;

    use super::*;
    use crate::{
        clock::MockClock,
        job::JobStatus,
        store::{memory::InMemoryQueueStore, StoreError},
    };

    fn fired_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, 2, 30).unwrap()
    }

    #[tokio::test]
    async fn enqueues_workflow_execution_and_records_fire() {
        let store = Arc::new(InMemoryQueueStore::new());
        let mut schedules = MockScheduleRepository::new();
        schedules
            .expect_record_fire()
            .with(
                eq("trigger-1"),
                eq(fired_at()),
                eq(Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap())),
            )
            .times(1)
            .returning(|_, _, _| Ok(()));
        let handler = ScheduledTriggerHandler::new(store.clone(), Arc::new(schedules))
            .with_clock(MockClock::new(fired_at()))
            .with_max_retries(7);
        let config = json!({"cron": "0 */5 * * * *"});
        let job = Job::scheduled_trigger("user", "workflow-1", "trigger-1", config.clone());

        handler
            .handle(&JobContext::for_job(&job, Utc::now()), &job.payload)
            .await
            .unwrap();

        let execution = store.dequeue().await.unwrap();
        assert_eq!(execution.status, JobStatus::Pending);
        assert_eq!(execution.user_id, "user");
        assert_eq!(execution.max_retries, 7);
        assert_eq!(
            execution.payload,
            JobPayload::WorkflowExecution {
                workflow_id: "workflow-1".to_owned(),
                trigger_data: json!({
                    "trigger_id": "trigger-1",
                    "fired_at": fired_at(),
                    "config": config,
                }),
            }
        );
    }

    #[tokio::test]
    async fn trigger_without_cron_has_no_next_fire() {
        let store = Arc::new(InMemoryQueueStore::new());
        let mut schedules = MockScheduleRepository::new();
        schedules
            .expect_record_fire()
            .with(eq("trigger-1"), eq(fired_at()), eq(None::<DateTime<Utc>>))
            .times(1)
            .returning(|_, _, _| Ok(()));
        let handler = ScheduledTriggerHandler::new(store.clone(), Arc::new(schedules))
            .with_clock(MockClock::new(fired_at()));
        let job = Job::scheduled_trigger("user", "workflow-1", "trigger-1", json!({}));

        handler
            .handle(&JobContext::for_job(&job, Utc::now()), &job.payload)
            .await
            .unwrap();

        assert_eq!(store.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn invalid_cron_enqueues_nothing() {
        let store = Arc::new(InMemoryQueueStore::new());
        let mut schedules = MockScheduleRepository::new();
        schedules.expect_record_fire().never();
        let handler = ScheduledTriggerHandler::new(store.clone(), Arc::new(schedules));
        let job = Job::scheduled_trigger(
            "user",
            "workflow-1",
            "trigger-1",
            json!({"cron": "every tuesday"}),
        );

        let result = handler
            .handle(&JobContext::for_job(&job, Utc::now()), &job.payload)
            .await;

        assert_matches!(result, Err(HandlerError::InvalidPayload(_)));
        assert_matches!(store.dequeue().await, Err(StoreError::QueueEmpty));
    }

    #[test]
    fn next_fire_time_is_strictly_after() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 5, 0).unwrap();
        assert_eq!(
            next_fire_time(&json!({"cron": "0 */5 * * * *"}), at).unwrap(),
            Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 10, 0).unwrap())
        );
        assert_matches!(
            next_fire_time(&json!({"cron": 5}), at),
            Err(HandlerError::InvalidPayload(_))
        );
    }
}
