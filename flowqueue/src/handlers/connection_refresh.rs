use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    handler::{BoxError, HandlerError, JobContext, JobHandler},
    job::{JobPayload, JobType},
};

/// Opaque credentials of a connection.
pub type AuthData = serde_json::Value;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConnectionRepository: Send + Sync {
    async fn load_auth(&self, connection_id: &str) -> Result<AuthData, BoxError>;
    async fn save_auth(&self, connection_id: &str, auth: &AuthData) -> Result<(), BoxError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_token(&self, auth: &AuthData) -> Result<AuthData, BoxError>;
}

/// Refreshes the credentials of a connection for [`JobPayload::ConnectionRefresh`] jobs.
pub struct ConnectionRefreshHandler {
    connections: Arc<dyn ConnectionRepository>,
    refresher: Arc<dyn TokenRefresher>,
}

impl ConnectionRefreshHandler {
    pub fn new(
        connections: Arc<dyn ConnectionRepository>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            connections,
            refresher,
        }
    }
}

#[async_trait]
impl JobHandler for ConnectionRefreshHandler {
    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<(), HandlerError> {
        let JobPayload::ConnectionRefresh { connection_id } = payload else {
            return Err(HandlerError::PayloadMismatch(JobType::ConnectionRefresh));
        };

        let auth = self
            .connections
            .load_auth(connection_id)
            .await
            .map_err(HandlerError::Collaborator)?;
        let refreshed = self
            .refresher
            .refresh_token(&auth)
            .await
            .map_err(HandlerError::Collaborator)?;
        self.connections
            .save_auth(connection_id, &refreshed)
            .await
            .map_err(HandlerError::Collaborator)?;

        tracing::debug!(job_id = %ctx.job_id, %connection_id, "Refreshed connection {connection_id}");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use chrono::Utc;
    use mockall::{predicate::eq, Sequence};
    use serde_json::json;

    use super::*;
    use crate::job::Job;

    #[tokio::test]
    async fn refreshes_and_saves_token() {
        let mut sequence = Sequence::new();
        let mut connections = MockConnectionRepository::new();
        let mut refresher = MockTokenRefresher::new();
        connections
            .expect_load_auth()
            .with(eq("connection-1"))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(json!({"refresh_token": "r1"})));
        refresher
            .expect_refresh_token()
            .with(eq(json!({"refresh_token": "r1"})))
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_| Ok(json!({"access_token": "a2", "refresh_token": "r2"})));
        connections
            .expect_save_auth()
            .with(
                eq("connection-1"),
                eq(json!({"access_token": "a2", "refresh_token": "r2"})),
            )
            .times(1)
            .in_sequence(&mut sequence)
            .returning(|_, _| Ok(()));
        let handler = ConnectionRefreshHandler::new(Arc::new(connections), Arc::new(refresher));
        let job = Job::connection_refresh("user", "connection-1");

        handler
            .handle(&JobContext::for_job(&job, Utc::now()), &job.payload)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn refresh_failure_keeps_old_credentials() {
        let mut connections = MockConnectionRepository::new();
        let mut refresher = MockTokenRefresher::new();
        connections
            .expect_load_auth()
            .returning(|_| Ok(json!({"refresh_token": "revoked"})));
        refresher
            .expect_refresh_token()
            .returning(|_| Err("invalid_grant".into()));
        connections.expect_save_auth().never();
        let handler = ConnectionRefreshHandler::new(Arc::new(connections), Arc::new(refresher));
        let job = Job::connection_refresh("user", "connection-1");

        assert_matches!(
            handler
                .handle(&JobContext::for_job(&job, Utc::now()), &job.payload)
                .await,
            Err(HandlerError::Collaborator(_))
        );
    }
}
