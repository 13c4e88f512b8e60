//! Job consumers: the workers executing attempts published to a job type's queue.
//!
//! - Handlers are registered per job type
//! - Each handler runs on `worker_threads` threads competing for one queue
//! - Outcomes are reported to the attempt, never directly to the job

pub mod executor;
pub mod types;

pub use executor::{ConsumerStats, JobConsumer, JobConsumerConfig, JobConsumerHandle};
pub use types::{JobContext, JobHandler, JobOutcome};
