//! Delayed delivery of messages.
//!
//! The job service needs two kinds of deferred messages:
//!
//! - the attempt timeout, armed when an attempt starts and canceled when it finishes
//! - the deferred execution of a retry that is waiting out its backoff
//!
//! Both are keyed by a [`ScheduleId`] so they can be replaced or canceled.

use chrono::{DateTime, Utc};

use crate::action::ScheduleId;
use crate::envelope::Envelope;

/// Port for scheduling a message to be sent later.
///
/// Delivery is at-least-once: a message that was due at the moment it was
/// unscheduled may still be delivered. Consumers tolerate that by ignoring events
/// that no longer apply to the instance's state.
pub trait MessageScheduler: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    /// Schedule `envelope` for delivery at `deliver_at`.
    ///
    /// Scheduling an id that is already pending replaces the earlier message.
    fn schedule(
        &self,
        schedule_id: ScheduleId,
        deliver_at: DateTime<Utc>,
        envelope: Envelope,
    ) -> Result<(), Self::Error>;

    /// Cancel a pending message. Returns whether one was pending.
    fn unschedule(&self, schedule_id: &ScheduleId) -> Result<bool, Self::Error>;
}

impl<S> MessageScheduler for std::sync::Arc<S>
where
    S: MessageScheduler + ?Sized,
{
    type Error = S::Error;

    fn schedule(
        &self,
        schedule_id: ScheduleId,
        deliver_at: DateTime<Utc>,
        envelope: Envelope,
    ) -> Result<(), Self::Error> {
        (**self).schedule(schedule_id, deliver_at, envelope)
    }

    fn unschedule(&self, schedule_id: &ScheduleId) -> Result<bool, Self::Error> {
        (**self).unschedule(schedule_id)
    }
}
