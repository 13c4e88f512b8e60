//! Work item and outcome types seen by job handlers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobservice_core::{AttemptId, JobId, JobTypeKey};
use jobservice_events::ExecuteAttempt;

/// Job handler function type.
pub type JobHandler = Box<dyn Fn(&JobContext) -> JobOutcome + Send + Sync>;

/// What a handler sees of the attempt it executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub job_id: JobId,
    pub attempt_id: AttemptId,
    /// 0 for the first attempt, then 1, 2, ... per retry.
    pub retry_number: u32,
    pub job_type: JobTypeKey,
    pub payload: JsonValue,
    /// The attempt times out at this instant whether or not the handler returned.
    pub deadline: DateTime<Utc>,
}

impl JobContext {
    pub fn is_retry(&self) -> bool {
        self.retry_number > 0
    }
}

impl From<&ExecuteAttempt> for JobContext {
    fn from(work: &ExecuteAttempt) -> Self {
        Self {
            job_id: work.job_id,
            attempt_id: work.attempt_id,
            retry_number: work.retry_number,
            job_type: work.job_type.clone(),
            payload: work.payload.clone(),
            deadline: work.deadline,
        }
    }
}

/// Handler result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobOutcome {
    /// Job succeeded with a result value.
    Completed(JsonValue),
    /// Job failed; the job's retry policy decides what happens next.
    Faulted(String),
}

impl JobOutcome {
    pub fn completed() -> Self {
        JobOutcome::Completed(JsonValue::Null)
    }

    pub fn faulted(reason: impl Into<String>) -> Self {
        JobOutcome::Faulted(reason.into())
    }
}

impl<E: core::fmt::Display> From<Result<JsonValue, E>> for JobOutcome {
    fn from(value: Result<JsonValue, E>) -> Self {
        match value {
            Ok(result) => JobOutcome::Completed(result),
            Err(err) => JobOutcome::Faulted(err.to_string()),
        }
    }
}
