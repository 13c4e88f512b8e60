//! Job type concurrency gate.
//!
//! One instance per job type. All slot arithmetic for a type happens while handling
//! a single event against a single persisted instance, so optimistic concurrency on
//! that instance is what keeps two racing grants from exceeding the limit.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobservice_core::{
    DomainError, DomainResult, JobId, JobTypeKey, SagaInstance, StateMachine, Transition,
};
use jobservice_events::{
    Endpoint, JobMessage, SagaAction, SetConcurrentJobLimit, SlotGranted, SlotReleased,
    SlotRequested,
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobTypeStatus {
    /// No job holds a slot.
    Idle,
    /// At least one job holds a slot.
    Active,
}

/// A slot request waiting for capacity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSlot {
    pub job_id: JobId,
    pub requested_at: DateTime<Utc>,
}

/// Persisted job type instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobType {
    job_type: JobTypeKey,
    status: JobTypeStatus,
    concurrent_job_limit: u32,
    /// Jobs currently holding a slot, in grant order.
    active_jobs: Vec<JobId>,
    /// FIFO of requests waiting for a slot.
    pending: VecDeque<PendingSlot>,
}

impl JobType {
    pub fn new(job_type: JobTypeKey, concurrent_job_limit: u32) -> DomainResult<Self> {
        ensure_limit(concurrent_job_limit)?;
        Ok(Self {
            job_type,
            status: JobTypeStatus::Idle,
            concurrent_job_limit,
            active_jobs: Vec::new(),
            pending: VecDeque::new(),
        })
    }

    pub fn job_type(&self) -> &JobTypeKey {
        &self.job_type
    }

    pub fn status(&self) -> JobTypeStatus {
        self.status
    }

    pub fn concurrent_job_limit(&self) -> u32 {
        self.concurrent_job_limit
    }

    pub fn running_count(&self) -> usize {
        self.active_jobs.len()
    }

    pub fn active_jobs(&self) -> &[JobId] {
        &self.active_jobs
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingSlot> {
        self.pending.iter()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn holds_slot(&self, job_id: JobId) -> bool {
        self.active_jobs.contains(&job_id)
    }

    pub fn is_queued(&self, job_id: JobId) -> bool {
        self.pending.iter().any(|p| p.job_id == job_id)
    }

    fn has_capacity(&self) -> bool {
        self.active_jobs.len() < self.concurrent_job_limit as usize
    }

    fn grant(&mut self, job_id: JobId) -> SagaAction {
        self.active_jobs.push(job_id);
        SagaAction::send(
            Endpoint::Job,
            JobMessage::SlotGranted(SlotGranted {
                job_id,
                job_type: self.job_type.clone(),
            }),
        )
    }

    /// Admit queued requests, oldest first, while capacity remains.
    fn grant_pending(&mut self) -> Vec<SagaAction> {
        let mut actions = Vec::new();
        while self.has_capacity() {
            let Some(next) = self.pending.pop_front() else {
                break;
            };
            actions.push(self.grant(next.job_id));
        }
        actions
    }

    fn refresh_status(&mut self) {
        self.status = if self.active_jobs.is_empty() {
            JobTypeStatus::Idle
        } else {
            JobTypeStatus::Active
        };
    }
}

impl SagaInstance for JobType {
    type Id = JobTypeKey;

    fn saga_type() -> &'static str {
        "jobservice.job_type"
    }

    fn correlation_id(&self) -> Self::Id {
        self.job_type.clone()
    }

    fn state_tag(&self) -> &'static str {
        match self.status {
            JobTypeStatus::Idle => "Idle",
            JobTypeStatus::Active => "Active",
        }
    }
}

/// Events consumed by the job type machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobTypeEvent {
    SlotRequested(SlotRequested),
    SlotReleased(SlotReleased),
    SetConcurrentJobLimit(SetConcurrentJobLimit),
}

impl JobTypeEvent {
    pub fn correlation_id(&self) -> &JobTypeKey {
        match self {
            JobTypeEvent::SlotRequested(e) => &e.job_type,
            JobTypeEvent::SlotReleased(e) => &e.job_type,
            JobTypeEvent::SetConcurrentJobLimit(e) => &e.job_type,
        }
    }
}

fn ensure_limit(limit: u32) -> DomainResult<()> {
    if limit == 0 {
        return Err(DomainError::validation(
            "concurrent job limit must be at least 1",
        ));
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JobTypeStateMachine;

impl StateMachine for JobTypeStateMachine {
    type Instance = JobType;
    type Event = JobTypeEvent;
    type Action = SagaAction;

    fn transition(
        current: Option<&JobType>,
        event: &JobTypeEvent,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition<JobType, SagaAction>> {
        match event {
            JobTypeEvent::SlotRequested(e) => on_slot_requested(current, e, now),
            JobTypeEvent::SlotReleased(e) => Ok(on_slot_released(current, e)),
            JobTypeEvent::SetConcurrentJobLimit(e) => on_set_limit(current, e),
        }
    }
}

fn on_slot_requested(
    current: Option<&JobType>,
    event: &SlotRequested,
    now: DateTime<Utc>,
) -> DomainResult<Transition<JobType, SagaAction>> {
    let mut job_type = match current {
        Some(existing) => existing.clone(),
        None => JobType::new(event.job_type.clone(), event.concurrent_job_limit)?,
    };

    if job_type.holds_slot(event.job_id) {
        // Redelivered request whose grant may have been lost: grant again.
        let action = SagaAction::send(
            Endpoint::Job,
            JobMessage::SlotGranted(SlotGranted {
                job_id: event.job_id,
                job_type: job_type.job_type.clone(),
            }),
        );
        return Ok(Transition::changed(job_type, vec![action]));
    }
    if job_type.is_queued(event.job_id) {
        return Ok(Transition::Ignored);
    }

    let actions = if job_type.has_capacity() && job_type.pending.is_empty() {
        vec![job_type.grant(event.job_id)]
    } else {
        job_type.pending.push_back(PendingSlot {
            job_id: event.job_id,
            requested_at: now,
        });
        Vec::new()
    };
    job_type.refresh_status();

    Ok(Transition::changed(job_type, actions))
}

fn on_slot_released(
    current: Option<&JobType>,
    event: &SlotReleased,
) -> Transition<JobType, SagaAction> {
    let Some(current) = current else {
        return Transition::Ignored;
    };

    let mut job_type = current.clone();

    if let Some(pos) = job_type.pending.iter().position(|p| p.job_id == event.job_id) {
        // Withdrawal of a request that was never granted.
        job_type.pending.remove(pos);
        return Transition::changed(job_type, Vec::new());
    }

    let Some(pos) = job_type.active_jobs.iter().position(|id| *id == event.job_id) else {
        return Transition::Ignored;
    };
    job_type.active_jobs.remove(pos);

    let actions = job_type.grant_pending();
    job_type.refresh_status();

    Transition::changed(job_type, actions)
}

fn on_set_limit(
    current: Option<&JobType>,
    event: &SetConcurrentJobLimit,
) -> DomainResult<Transition<JobType, SagaAction>> {
    ensure_limit(event.concurrent_job_limit)?;

    let Some(current) = current else {
        let job_type = JobType::new(event.job_type.clone(), event.concurrent_job_limit)?;
        return Ok(Transition::changed(job_type, Vec::new()));
    };

    if current.concurrent_job_limit == event.concurrent_job_limit {
        return Ok(Transition::Ignored);
    }

    // Lowering never preempts running jobs; it only delays future grants.
    let mut job_type = current.clone();
    job_type.concurrent_job_limit = event.concurrent_job_limit;
    let actions = job_type.grant_pending();
    job_type.refresh_status();

    Ok(Transition::changed(job_type, actions))
}
