//! The built-in handlers, one per [`JobType`](crate::job::JobType).
//!
//! Handlers reach the rest of the platform only through the collaborator traits defined next to
//! them, which are injected through [`Collaborators`].
use std::sync::Arc;

pub mod connection_refresh;
pub mod scheduled_trigger;
pub mod webhook;
pub mod workflow;

use connection_refresh::{ConnectionRepository, TokenRefresher};
use scheduled_trigger::ScheduleRepository;
use webhook::WebhookClient;
use workflow::WorkflowEngine;

/// The external services required by the built-in handlers.
#[derive(Clone)]
pub struct Collaborators {
    pub workflow_engine: Arc<dyn WorkflowEngine>,
    pub webhook_client: Arc<dyn WebhookClient>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub connections: Arc<dyn ConnectionRepository>,
    pub token_refresher: Arc<dyn TokenRefresher>,
}
