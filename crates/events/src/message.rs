//! Messages exchanged between submitters, the state machines, workers, and
//! notification subscribers.
//!
//! Messages are facts or requests addressed to one correlation id. They are
//! delivered at least once, so every consumer must treat a duplicate as a no-op.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobservice_core::{AttemptId, JobId, JobTypeKey, RetryPolicy};

/// Command: SubmitJob (creates the job instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitJob {
    pub job_id: JobId,
    pub job_type: JobTypeKey,
    pub payload: JsonValue,
    pub retry_policy: RetryPolicy,
    /// Maximum duration of a single attempt before it times out.
    pub max_attempt_duration: Duration,
    /// Cap applied if this submission creates the job type instance.
    pub concurrent_job_limit: u32,
}

/// Command: CancelRequested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequested {
    pub job_id: JobId,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Request for a concurrency slot of a job type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRequested {
    pub job_id: JobId,
    pub job_type: JobTypeKey,
    /// Only used when the job type instance does not exist yet.
    pub concurrent_job_limit: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotGranted {
    pub job_id: JobId,
    pub job_type: JobTypeKey,
}

/// Frees a held slot, or withdraws a request that is still queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotReleased {
    pub job_id: JobId,
    pub job_type: JobTypeKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetConcurrentJobLimit {
    pub job_type: JobTypeKey,
    pub concurrent_job_limit: u32,
}

/// Command: StartAttempt (creates the attempt instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartAttempt {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
    pub retry_number: u32,
    pub job_type: JobTypeKey,
    pub payload: JsonValue,
    pub max_duration: Duration,
    /// Execution is deferred until this instant (retry backoff).
    pub not_before: DateTime<Utc>,
}

/// Work item published to a job type's consumer queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteAttempt {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
    pub retry_number: u32,
    pub job_type: JobTypeKey,
    pub payload: JsonValue,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelAttempt {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
    pub retry_number: u32,
    pub job_type: JobTypeKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptCompleted {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
    pub result: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptFaulted {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
    pub reason: String,
    /// Set when the fault was produced by the attempt timeout.
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptCanceled {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
}

/// Scheduled, self-addressed to the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptTimeoutExpired {
    pub attempt_id: AttemptId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: JobId,
    pub job_type: JobTypeKey,
    pub attempt_id: AttemptId,
    pub result: JsonValue,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFaulted {
    pub job_id: JobId,
    pub job_type: JobTypeKey,
    pub reason: String,
    /// Total attempts made (first attempt + retries).
    pub attempts: u32,
    pub faulted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCanceled {
    pub job_id: JobId,
    pub job_type: JobTypeKey,
    pub reason: Option<String>,
    pub canceled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobMessage {
    SubmitJob(SubmitJob),
    CancelRequested(CancelRequested),
    SlotRequested(SlotRequested),
    SlotGranted(SlotGranted),
    SlotReleased(SlotReleased),
    SetConcurrentJobLimit(SetConcurrentJobLimit),
    StartAttempt(StartAttempt),
    ExecuteAttempt(ExecuteAttempt),
    CancelAttempt(CancelAttempt),
    AttemptCompleted(AttemptCompleted),
    AttemptFaulted(AttemptFaulted),
    AttemptCanceled(AttemptCanceled),
    AttemptTimeoutExpired(AttemptTimeoutExpired),
    JobCompleted(JobCompleted),
    JobFaulted(JobFaulted),
    JobCanceled(JobCanceled),
}

impl JobMessage {
    /// Stable message name (e.g. "jobservice.slot_requested").
    pub fn message_type(&self) -> &'static str {
        match self {
            JobMessage::SubmitJob(_) => "jobservice.submit_job",
            JobMessage::CancelRequested(_) => "jobservice.cancel_requested",
            JobMessage::SlotRequested(_) => "jobservice.slot_requested",
            JobMessage::SlotGranted(_) => "jobservice.slot_granted",
            JobMessage::SlotReleased(_) => "jobservice.slot_released",
            JobMessage::SetConcurrentJobLimit(_) => "jobservice.set_concurrent_job_limit",
            JobMessage::StartAttempt(_) => "jobservice.start_attempt",
            JobMessage::ExecuteAttempt(_) => "jobservice.execute_attempt",
            JobMessage::CancelAttempt(_) => "jobservice.cancel_attempt",
            JobMessage::AttemptCompleted(_) => "jobservice.attempt_completed",
            JobMessage::AttemptFaulted(_) => "jobservice.attempt_faulted",
            JobMessage::AttemptCanceled(_) => "jobservice.attempt_canceled",
            JobMessage::AttemptTimeoutExpired(_) => "jobservice.attempt_timeout_expired",
            JobMessage::JobCompleted(_) => "jobservice.job_completed",
            JobMessage::JobFaulted(_) => "jobservice.job_faulted",
            JobMessage::JobCanceled(_) => "jobservice.job_canceled",
        }
    }

    /// Job the message concerns, when it names one.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            JobMessage::SubmitJob(m) => Some(m.job_id),
            JobMessage::CancelRequested(m) => Some(m.job_id),
            JobMessage::SlotRequested(m) => Some(m.job_id),
            JobMessage::SlotGranted(m) => Some(m.job_id),
            JobMessage::SlotReleased(m) => Some(m.job_id),
            JobMessage::StartAttempt(m) => Some(m.job_id),
            JobMessage::ExecuteAttempt(m) => Some(m.job_id),
            JobMessage::CancelAttempt(m) => Some(m.job_id),
            JobMessage::AttemptCompleted(m) => Some(m.job_id),
            JobMessage::AttemptFaulted(m) => Some(m.job_id),
            JobMessage::AttemptCanceled(m) => Some(m.job_id),
            JobMessage::JobCompleted(m) => Some(m.job_id),
            JobMessage::JobFaulted(m) => Some(m.job_id),
            JobMessage::JobCanceled(m) => Some(m.job_id),
            JobMessage::SetConcurrentJobLimit(_) | JobMessage::AttemptTimeoutExpired(_) => None,
        }
    }

    /// Whether this is one of the caller-visible terminal notifications.
    pub fn is_terminal_notification(&self) -> bool {
        matches!(
            self,
            JobMessage::JobCompleted(_) | JobMessage::JobFaulted(_) | JobMessage::JobCanceled(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_serialize_with_a_type_tag() {
        let msg = JobMessage::SlotGranted(SlotGranted {
            job_id: JobId::new(),
            job_type: JobTypeKey::new("reports.export").unwrap(),
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "slot_granted");
        assert_eq!(json["job_type"], "reports.export");

        let back: JobMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn faulted_without_timeout_flag_defaults_to_false() {
        let json = serde_json::json!({
            "type": "attempt_faulted",
            "job_id": JobId::new(),
            "attempt_id": AttemptId::new(),
            "reason": "boom",
        });

        match serde_json::from_value::<JobMessage>(json).unwrap() {
            JobMessage::AttemptFaulted(f) => assert!(!f.timed_out),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
