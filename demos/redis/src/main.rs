use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use flowqueue::{
    handler::BoxError,
    handlers::{
        connection_refresh::{AuthData, ConnectionRepository, TokenRefresher},
        scheduled_trigger::ScheduleRepository,
        webhook::WebhookClient,
        workflow::{WorkflowEngine, WorkflowExecution},
    },
    prelude::*,
};
use flowqueue_redis::RedisQueueStore;
use serde_json::json;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1/";
const REDIS_URL: &str = "REDIS_URL";

#[tokio::main]
pub async fn main() {
    let redis_url = std::env::var(REDIS_URL).unwrap_or_else(|_| DEFAULT_REDIS_URL.to_owned());
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let store: Arc<dyn QueueStore> = Arc::new(
        RedisQueueStore::connect(&redis_url, "flowqueue-demo")
            .await
            .unwrap(),
    );
    let config = WorkerConfig::default()
        .with_workers(2)
        .with_poll_interval(Duration::from_millis(250));
    let pool = WorkerPool::with_default_handlers(
        store.clone(),
        Collaborators {
            workflow_engine: Arc::new(PrintingPlatform),
            webhook_client: Arc::new(PrintingPlatform),
            schedules: Arc::new(PrintingPlatform),
            connections: Arc::new(PrintingPlatform),
            token_refresher: Arc::new(PrintingPlatform),
        },
        config,
    );
    pool.start().await.unwrap();

    for job in [
        Job::workflow_execution("user-1", "workflow-1", json!({"source": "demo"})),
        Job::webhook_delivery(
            "user-1",
            "https://example.com/hook",
            json!({"event": "demo"}),
            HashMap::from([("x-demo".to_owned(), "1".to_owned())]),
        ),
        Job::scheduled_trigger(
            "user-1",
            "workflow-2",
            "trigger-1",
            json!({"cron": "0 */5 * * * *"}),
        ),
        Job::connection_refresh("user-1", "connection-1"),
    ] {
        let job_id = store.enqueue(job).await.unwrap();
        println!("Inserted job {job_id}");
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    println!("{:?}", store.stats().await.unwrap());
    pool.stop().await.unwrap();
}

/// Stands in for the rest of the platform.
struct PrintingPlatform;

#[async_trait]
impl WorkflowEngine for PrintingPlatform {
    async fn execute_workflow(
        &self,
        workflow_id: &str,
        trigger_data: &serde_json::Value,
    ) -> Result<WorkflowExecution, BoxError> {
        println!("Running workflow {workflow_id} with {trigger_data}");
        Ok(WorkflowExecution {
            execution_id: format!("{workflow_id}-execution"),
            status: "success".to_owned(),
        })
    }
}

#[async_trait]
impl WebhookClient for PrintingPlatform {
    async fn post(
        &self,
        url: &str,
        _headers: &HashMap<String, String>,
        body: &serde_json::Value,
    ) -> Result<u16, BoxError> {
        println!("POST {url} {body}");
        Ok(200)
    }
}

#[async_trait]
impl ScheduleRepository for PrintingPlatform {
    async fn record_fire(
        &self,
        trigger_id: &str,
        last_triggered_at: chrono::DateTime<chrono::Utc>,
        next_trigger_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Result<(), BoxError> {
        println!("Trigger {trigger_id} fired at {last_triggered_at}, next at {next_trigger_at:?}");
        Ok(())
    }
}

#[async_trait]
impl ConnectionRepository for PrintingPlatform {
    async fn load_auth(&self, connection_id: &str) -> Result<AuthData, BoxError> {
        Ok(json!({"connection_id": connection_id, "refresh_token": "demo"}))
    }

    async fn save_auth(&self, connection_id: &str, auth: &AuthData) -> Result<(), BoxError> {
        println!("Saved credentials of {connection_id}: {auth}");
        Ok(())
    }
}

#[async_trait]
impl TokenRefresher for PrintingPlatform {
    async fn refresh_token(&self, auth: &AuthData) -> Result<AuthData, BoxError> {
        let mut refreshed = auth.clone();
        refreshed["access_token"] = json!("refreshed");
        Ok(refreshed)
    }
}
