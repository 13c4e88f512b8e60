//! In-memory scheduler: pending messages held in a map until a pump releases them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::action::ScheduleId;
use crate::envelope::Envelope;
use crate::in_memory_bus::InMemoryBusError;
use crate::scheduler::MessageScheduler;

#[derive(Debug, Clone)]
struct PendingMessage {
    deliver_at: DateTime<Utc>,
    envelope: Envelope,
}

/// Scheduler for tests/dev and single-process nodes.
///
/// It never sends anything on its own. A pump (a background thread in production,
/// the test harness in tests) calls [`InMemoryMessageScheduler::release_due`] and
/// forwards the returned envelopes to the bus.
#[derive(Debug, Default)]
pub struct InMemoryMessageScheduler {
    pending: Mutex<HashMap<ScheduleId, PendingMessage>>,
}

impl InMemoryMessageScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Remove and return every message due at or before `now`, earliest first.
    pub fn release_due(&self, now: DateTime<Utc>) -> Result<Vec<Envelope>, InMemoryBusError> {
        let mut pending = self.pending.lock().map_err(|_| InMemoryBusError::Poisoned)?;

        let due_ids: Vec<ScheduleId> = pending
            .iter()
            .filter(|(_, p)| p.deliver_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        let mut due: Vec<PendingMessage> = due_ids
            .iter()
            .filter_map(|id| pending.remove(id))
            .collect();
        due.sort_by_key(|p| p.deliver_at);

        Ok(due.into_iter().map(|p| p.envelope).collect())
    }

    /// Earliest delivery time among pending messages.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        let pending = self.pending.lock().ok()?;
        pending.values().map(|p| p.deliver_at).min()
    }

    pub fn is_pending(&self, schedule_id: &ScheduleId) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains_key(schedule_id))
            .unwrap_or(false)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl MessageScheduler for InMemoryMessageScheduler {
    type Error = InMemoryBusError;

    fn schedule(
        &self,
        schedule_id: ScheduleId,
        deliver_at: DateTime<Utc>,
        envelope: Envelope,
    ) -> Result<(), Self::Error> {
        let mut pending = self.pending.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        pending.insert(
            schedule_id,
            PendingMessage {
                deliver_at,
                envelope,
            },
        );
        Ok(())
    }

    fn unschedule(&self, schedule_id: &ScheduleId) -> Result<bool, Self::Error> {
        let mut pending = self.pending.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        Ok(pending.remove(schedule_id).is_some())
    }
}
