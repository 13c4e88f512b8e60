//! `jobservice-core` — building blocks shared by the job orchestration state machines.
//!
//! This crate contains **pure** primitives (no IO, no threads, no transport).

pub mod error;
pub mod id;
pub mod retry;
pub mod state_machine;

pub use error::{DomainError, DomainResult};
pub use id::{AttemptId, JobId, JobTypeKey};
pub use retry::{BackoffStrategy, RetryPolicy};
pub use state_machine::{ExpectedVersion, SagaInstance, StateMachine, Transition};
