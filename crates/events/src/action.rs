//! Outbound side effects of a state machine transition.
//!
//! - Transitions return actions as data; they never call another machine directly
//! - Infra performs the actions only after the new instance version was saved
//! - Actions may be performed more than once (crash between save and send), so
//!   every receiver deduplicates by correlation id and state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobservice_core::AttemptId;

use crate::endpoint::Endpoint;
use crate::message::JobMessage;

/// Identifier of a scheduled message, used to replace or cancel it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScheduleId(String);

impl ScheduleId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The timeout armed when an attempt starts.
    pub fn attempt_timeout(attempt_id: AttemptId) -> Self {
        Self(format!("attempt-timeout:{attempt_id}"))
    }

    /// Deferred execution of an attempt waiting out a retry backoff.
    pub fn attempt_execution(attempt_id: AttemptId) -> Self {
        Self(format!("attempt-execution:{attempt_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Actions a state machine emits in response to an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SagaAction {
    /// Send a message to an endpoint now.
    Send {
        endpoint: Endpoint,
        message: JobMessage,
    },
    /// Deliver a message to an endpoint at `deliver_at`. Scheduling an id that is
    /// already pending replaces it.
    Schedule {
        schedule_id: ScheduleId,
        deliver_at: DateTime<Utc>,
        endpoint: Endpoint,
        message: JobMessage,
    },
    /// Cancel a pending scheduled message (no-op if it already fired).
    Unschedule { schedule_id: ScheduleId },
}

impl SagaAction {
    pub fn send(endpoint: Endpoint, message: JobMessage) -> Self {
        SagaAction::Send { endpoint, message }
    }

    /// The message carried by a `Send` or `Schedule` action.
    pub fn message(&self) -> Option<&JobMessage> {
        match self {
            SagaAction::Send { message, .. } | SagaAction::Schedule { message, .. } => {
                Some(message)
            }
            SagaAction::Unschedule { .. } => None,
        }
    }

    pub fn endpoint(&self) -> Option<&Endpoint> {
        match self {
            SagaAction::Send { endpoint, .. } | SagaAction::Schedule { endpoint, .. } => {
                Some(endpoint)
            }
            SagaAction::Unschedule { .. } => None,
        }
    }
}
