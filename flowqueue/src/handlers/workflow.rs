use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    handler::{BoxError, HandlerError, JobContext, JobHandler},
    job::{JobPayload, JobType},
};

/// The outcome reported by the workflow engine for one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub execution_id: String,
    pub status: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    async fn execute_workflow(
        &self,
        workflow_id: &str,
        trigger_data: &serde_json::Value,
    ) -> Result<WorkflowExecution, BoxError>;
}

/// Runs [`JobPayload::WorkflowExecution`] jobs on the workflow engine.
pub struct WorkflowExecutionHandler {
    engine: Arc<dyn WorkflowEngine>,
}

impl WorkflowExecutionHandler {
    pub fn new(engine: Arc<dyn WorkflowEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl JobHandler for WorkflowExecutionHandler {
    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<(), HandlerError> {
        let JobPayload::WorkflowExecution {
            workflow_id,
            trigger_data,
        } = payload
        else {
            return Err(HandlerError::PayloadMismatch(JobType::WorkflowExecution));
        };

        let execution = self
            .engine
            .execute_workflow(workflow_id, trigger_data)
            .await
            .map_err(HandlerError::Collaborator)?;

        tracing::debug!(
            job_id = %ctx.job_id,
            %workflow_id,
            execution_id = %execution.execution_id,
            status = %execution.status,
            "Executed workflow {workflow_id}",
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use mockall::predicate::eq;
    use serde_json::json;

    use super::*;
    use crate::job::Job;

    #[tokio::test]
    async fn executes_workflow_with_trigger_data() {
        let job = Job::workflow_execution("user", "workflow-1", json!({"order": 42}));
        let mut engine = MockWorkflowEngine::new();
        engine
            .expect_execute_workflow()
            .with(eq("workflow-1"), eq(json!({"order": 42})))
            .times(1)
            .returning(|_, _| {
                Ok(WorkflowExecution {
                    execution_id: "execution-1".to_owned(),
                    status: "success".to_owned(),
                })
            });
        let handler = WorkflowExecutionHandler::new(Arc::new(engine));

        handler
            .handle(&JobContext::for_job(&job, Utc::now()), &job.payload)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn engine_error_fails_the_attempt() {
        let job = Job::workflow_execution("user", "workflow-1", json!({}));
        let mut engine = MockWorkflowEngine::new();
        engine
            .expect_execute_workflow()
            .returning(|_, _| Err("engine unavailable".into()));
        let handler = WorkflowExecutionHandler::new(Arc::new(engine));

        let result = handler
            .handle(&JobContext::for_job(&job, Utc::now()), &job.payload)
            .await;

        assert_matches!(result, Err(HandlerError::Collaborator(err)) if err.to_string() == "engine unavailable");
    }
}
