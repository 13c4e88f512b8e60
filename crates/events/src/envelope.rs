use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::endpoint::Endpoint;
use crate::message::JobMessage;

/// Envelope for a message in transit.
///
/// Notes:
/// - `message_id` is unique per send; redeliveries of the same send keep it.
/// - `endpoint` is the logical queue the message is addressed to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: Uuid,
    endpoint: Endpoint,
    sent_at: DateTime<Utc>,
    message: JobMessage,
}

impl Envelope {
    pub fn new(endpoint: Endpoint, message: JobMessage, sent_at: DateTime<Utc>) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            endpoint,
            sent_at,
            message,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    pub fn message(&self) -> &JobMessage {
        &self.message
    }

    pub fn into_message(self) -> JobMessage {
        self.message
    }
}
