//! A durable job queue and worker pool for running workflow automation jobs in the background.
//!
//! Jobs are persisted in a [`QueueStore`](store::QueueStore), claimed by the workers of a
//! [`WorkerPool`](worker::WorkerPool) and dispatched to the [`JobHandler`](handler::JobHandler)
//! registered for their [`JobType`](job::JobType). Failed attempts are retried with backoff
//! until the job's retry budget is spent. Jobs are delivered at least once: a job claimed by a
//! process that crashes is put back in the queue on the next startup, or by the stale job reaper
//! once its processing lock expires.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use flowqueue::prelude::*;
//!
//! struct Refresh;
//!
//! #[async_trait]
//! impl JobHandler for Refresh {
//!     async fn handle(&self, ctx: &JobContext, payload: &JobPayload) -> Result<(), HandlerError> {
//!         println!("refreshing for {}: {payload:?}", ctx.user_id);
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = Arc::new(InMemoryQueueStore::new());
//! let handlers = HandlerRegistry::new().with_handler(JobType::ConnectionRefresh, Refresh);
//! let worker = Worker::new(0, store.clone(), Arc::new(handlers), WorkerConfig::default());
//!
//! let id = store
//!     .enqueue(Job::connection_refresh("user-1", "connection-1"))
//!     .await
//!     .unwrap();
//!
//! assert_eq!(worker.process_next().await.unwrap(), Some(JobStatus::Completed));
//! assert_eq!(store.get(id).await.unwrap().status, JobStatus::Completed);
//! # }
//! ```

pub mod backoff;
pub mod clock;
pub mod handler;
pub mod handlers;
pub mod job;
pub mod prelude;
pub mod reaper;
pub mod store;
pub mod worker;
