//! Logical endpoints (queues) of the job service.

use serde::{Deserialize, Serialize};

use jobservice_core::JobTypeKey;

/// A logical queue.
///
/// Every endpoint has competing-consumer semantics: each message sent to it is
/// delivered to exactly one of the consumers subscribed to it, regardless of how
/// many service instances subscribe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "job_type", rename_all = "snake_case")]
pub enum Endpoint {
    /// Consumed by the job type state machine (correlation: job type key).
    JobType,
    /// Consumed by the job state machine (correlation: job id).
    Job,
    /// Consumed by the job attempt state machine (correlation: attempt id).
    JobAttempt,
    /// Execution queue of one job type, consumed by workers.
    JobConsumer(JobTypeKey),
    /// Terminal notifications for external subscribers.
    Notifications,
}

impl Endpoint {
    /// Whether a state machine (rather than a worker or subscriber) consumes it.
    pub fn is_state_machine(&self) -> bool {
        matches!(self, Endpoint::JobType | Endpoint::Job | Endpoint::JobAttempt)
    }
}

impl core::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Endpoint::JobType => f.write_str("job-type"),
            Endpoint::Job => f.write_str("job"),
            Endpoint::JobAttempt => f.write_str("job-attempt"),
            Endpoint::JobConsumer(job_type) => write!(f, "job-consumer:{job_type}"),
            Endpoint::Notifications => f.write_str("notifications"),
        }
    }
}
