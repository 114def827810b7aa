//! The purpose of this module is to alleviate the need to import many of the `[flowqueue]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use flowqueue::prelude::*;
//! ```
pub use crate::backoff::BackoffStrategy;
pub use crate::backoff::Jitter;
pub use crate::backoff::Strategy;
pub use crate::clock::{Clock, SystemClock};
pub use crate::handler::{HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use crate::handlers::Collaborators;
pub use crate::job::{Job, JobId, JobPayload, JobStatus, JobType};
pub use crate::store::memory::InMemoryQueueStore;
pub use crate::store::{QueueStats, QueueStore, StoreConfig, StoreError};
pub use crate::worker::{PoolError, StartupRecovery, Worker, WorkerConfig, WorkerPool};
