//! Infrastructure layer: saga persistence, dispatch, workers, and service hosting.

pub mod config;
pub mod consumer;
pub mod dispatcher;
pub mod saga;
pub mod saga_repository;
pub mod service;
pub mod workers;

mod integration_tests;

pub use config::{ConfigError, JobServiceOptions, JobTypeOptions};
pub use consumer::{ConsumerStats, JobConsumer, JobContext, JobOutcome};
pub use dispatcher::{DispatchError, DispatchOutcome, Dispatcher};
pub use saga::{SagaExecutor, SagaRepositories};
pub use service::{ClientError, JobClient, JobService, JobServiceHandle};
