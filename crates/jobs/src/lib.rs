//! Job orchestration state machines.
//!
//! This crate contains the three cooperating machines, implemented purely as
//! deterministic transition functions (no IO, no threads, no storage):
//!
//! - [`JobTypeStateMachine`]: per-job-type concurrency gate (slot admission)
//! - [`JobStateMachine`]: job lifecycle, retries, cancellation
//! - [`JobAttemptStateMachine`]: one execution try, its timeout and its outcome
//!
//! Machines never talk to each other directly. Every transition returns the
//! outbound messages as [`SagaAction`](jobservice_events::SagaAction)s addressed to
//! the endpoint of the receiving machine.

pub mod job;
pub mod job_attempt;
pub mod job_type;

pub use job::{Job, JobEvent, JobStateMachine, JobStatus};
pub use job_attempt::{AttemptStatus, JobAttempt, JobAttemptEvent, JobAttemptStateMachine};
pub use job_type::{JobType, JobTypeEvent, JobTypeStateMachine, JobTypeStatus, PendingSlot};

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// `at + duration`, saturating at the largest representable instant.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
