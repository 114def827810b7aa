use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    handler::{BoxError, HandlerError, JobContext, JobHandler},
    job::{JobPayload, JobType},
};

/// Sends a JSON body to a URL and reports the response status.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WebhookClient: Send + Sync {
    async fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &serde_json::Value,
    ) -> Result<u16, BoxError>;
}

/// [`WebhookClient`] backed by [`reqwest`].
#[derive(Debug, Clone)]
pub struct ReqwestWebhookClient {
    client: reqwest::Client,
}

impl ReqwestWebhookClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookClient for ReqwestWebhookClient {
    async fn post(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &serde_json::Value,
    ) -> Result<u16, BoxError> {
        let request = headers
            .iter()
            .fold(self.client.post(url).json(body), |request, (name, value)| {
                request.header(name, value)
            });
        let response = request.send().await?;
        Ok(response.status().as_u16())
    }
}

/// Delivers [`JobPayload::WebhookDelivery`] jobs. Any status outside `2xx` fails the attempt.
pub struct WebhookDeliveryHandler {
    client: Arc<dyn WebhookClient>,
}

impl WebhookDeliveryHandler {
    pub fn new(client: Arc<dyn WebhookClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl JobHandler for WebhookDeliveryHandler {
    async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<(), HandlerError> {
        let JobPayload::WebhookDelivery { url, body, headers } = payload else {
            return Err(HandlerError::PayloadMismatch(JobType::WebhookDelivery));
        };

        let status = self
            .client
            .post(url, headers, body)
            .await
            .map_err(HandlerError::Collaborator)?;

        if (200..300).contains(&status) {
            tracing::debug!(job_id = %ctx.job_id, %url, status, "Delivered webhook to {url}");
            Ok(())
        } else {
            tracing::warn!(job_id = %ctx.job_id, %url, status, "Webhook {url} responded with {status}");
            Err(HandlerError::UnexpectedStatus(status))
        }
    }
}
