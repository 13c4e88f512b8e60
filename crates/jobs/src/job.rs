//! Job lifecycle.
//!
//! ```text
//! Submitted -> WaitingForSlot -> Running -> Completed | Faulted | Canceled
//!                     \______________\_____________________/^ (CancelRequested)
//! ```
//!
//! The job owns the list of its attempt ids and the retry policy. Attempts are
//! separate instances referenced by id; the job only ever talks to them (and to its
//! job type) through messages.
//!
//! A cancellation handled before its job's submission leaves a canceled job with no
//! job type. The submission arriving afterwards fills in the details and announces
//! the cancellation instead of requesting a slot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobservice_core::{
    AttemptId, DomainError, DomainResult, JobId, JobTypeKey, RetryPolicy, SagaInstance,
    StateMachine, Transition,
};
use jobservice_events::{
    AttemptCanceled, AttemptCompleted, AttemptFaulted, CancelAttempt, CancelRequested, Endpoint,
    JobCanceled, JobCompleted, JobFaulted, JobMessage, SagaAction, SlotGranted, SlotReleased,
    SlotRequested, StartAttempt, SubmitJob,
};

use crate::add_duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Freshly created; left within the creating transition.
    Submitted,
    WaitingForSlot,
    Running,
    Completed,
    Faulted,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Faulted | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Submitted => "Submitted",
            JobStatus::WaitingForSlot => "WaitingForSlot",
            JobStatus::Running => "Running",
            JobStatus::Completed => "Completed",
            JobStatus::Faulted => "Faulted",
            JobStatus::Canceled => "Canceled",
        }
    }
}

/// Persisted job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    job_id: JobId,
    /// `None` until the submission of a job canceled ahead of it is handled.
    job_type: Option<JobTypeKey>,
    payload: JsonValue,
    status: JobStatus,
    submitted_at: DateTime<Utc>,
    retry_count: u32,
    retry_policy: RetryPolicy,
    max_attempt_duration: Duration,
    attempt_ids: Vec<AttemptId>,
    active_attempt: Option<AttemptId>,
    result: Option<JsonValue>,
    fault_reason: Option<String>,
    cancel_reason: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

impl Job {
    fn submitted(cmd: &SubmitJob, now: DateTime<Utc>) -> DomainResult<Self> {
        if cmd.max_attempt_duration.is_zero() {
            return Err(DomainError::validation(
                "max attempt duration must be greater than zero",
            ));
        }

        Ok(Self {
            job_id: cmd.job_id,
            job_type: Some(cmd.job_type.clone()),
            payload: cmd.payload.clone(),
            status: JobStatus::Submitted,
            submitted_at: now,
            retry_count: 0,
            retry_policy: cmd.retry_policy.clone(),
            max_attempt_duration: cmd.max_attempt_duration,
            attempt_ids: Vec::new(),
            active_attempt: None,
            result: None,
            fault_reason: None,
            cancel_reason: None,
            finished_at: None,
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> Option<&JobTypeKey> {
        self.job_type.as_ref()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn max_attempt_duration(&self) -> Duration {
        self.max_attempt_duration
    }

    pub fn attempt_ids(&self) -> &[AttemptId] {
        &self.attempt_ids
    }

    pub fn active_attempt(&self) -> Option<AttemptId> {
        self.active_attempt
    }

    pub fn result(&self) -> Option<&JsonValue> {
        self.result.as_ref()
    }

    pub fn fault_reason(&self) -> Option<&str> {
        self.fault_reason.as_deref()
    }

    pub fn cancel_reason(&self) -> Option<&str> {
        self.cancel_reason.as_deref()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn is_active_attempt(&self, attempt_id: AttemptId) -> bool {
        self.status == JobStatus::Running && self.active_attempt == Some(attempt_id)
    }

    /// Create the next attempt (retry number = current retry count).
    fn start_attempt(&mut self, job_type: &JobTypeKey, not_before: DateTime<Utc>) -> SagaAction {
        let attempt_id = AttemptId::for_retry(self.job_id, self.retry_count);
        self.attempt_ids.push(attempt_id);
        self.active_attempt = Some(attempt_id);

        SagaAction::send(
            Endpoint::JobAttempt,
            JobMessage::StartAttempt(StartAttempt {
                job_id: self.job_id,
                attempt_id,
                retry_number: self.retry_count,
                job_type: job_type.clone(),
                payload: self.payload.clone(),
                max_duration: self.max_attempt_duration,
                not_before,
            }),
        )
    }

    fn release_slot(&self, job_type: &JobTypeKey) -> SagaAction {
        SagaAction::send(
            Endpoint::JobType,
            JobMessage::SlotReleased(SlotReleased {
                job_id: self.job_id,
                job_type: job_type.clone(),
            }),
        )
    }

    fn finish(&mut self, status: JobStatus, now: DateTime<Utc>) {
        self.status = status;
        self.active_attempt = None;
        self.finished_at = Some(now);
    }
}

impl SagaInstance for Job {
    type Id = JobId;

    fn saga_type() -> &'static str {
        "jobservice.job"
    }

    fn correlation_id(&self) -> Self::Id {
        self.job_id
    }

    fn state_tag(&self) -> &'static str {
        self.status.as_str()
    }
}

/// Events consumed by the job machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobEvent {
    Submit(SubmitJob),
    SlotGranted(SlotGranted),
    AttemptCompleted(AttemptCompleted),
    AttemptFaulted(AttemptFaulted),
    AttemptCanceled(AttemptCanceled),
    CancelRequested(CancelRequested),
}

impl JobEvent {
    pub fn correlation_id(&self) -> JobId {
        match self {
            JobEvent::Submit(e) => e.job_id,
            JobEvent::SlotGranted(e) => e.job_id,
            JobEvent::AttemptCompleted(e) => e.job_id,
            JobEvent::AttemptFaulted(e) => e.job_id,
            JobEvent::AttemptCanceled(e) => e.job_id,
            JobEvent::CancelRequested(e) => e.job_id,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JobStateMachine;

impl StateMachine for JobStateMachine {
    type Instance = Job;
    type Event = JobEvent;
    type Action = SagaAction;

    fn transition(
        current: Option<&Job>,
        event: &JobEvent,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition<Job, SagaAction>> {
        let Some(job) = current else {
            return match event {
                JobEvent::Submit(cmd) => on_submit(cmd, now),
                JobEvent::CancelRequested(e) => Ok(on_cancel_before_submit(e, now)),
                _ => Ok(Transition::Ignored),
            };
        };

        let Some(job_type) = job.job_type.clone() else {
            return Ok(match event {
                JobEvent::Submit(cmd) => on_submit_after_cancel(job, cmd),
                _ => Transition::Ignored,
            });
        };

        let transition = match event {
            // Duplicate submission of an existing job.
            JobEvent::Submit(_) => Transition::Ignored,
            JobEvent::SlotGranted(_) => on_slot_granted(job, &job_type, now),
            JobEvent::AttemptCompleted(e) => on_attempt_completed(job, &job_type, e, now),
            JobEvent::AttemptFaulted(e) => on_attempt_faulted(job, &job_type, e, now),
            // The job is already canceled by the time its attempt confirms.
            JobEvent::AttemptCanceled(_) => Transition::Ignored,
            JobEvent::CancelRequested(e) => on_cancel_requested(job, &job_type, e, now),
        };
        Ok(transition)
    }
}

fn on_submit(cmd: &SubmitJob, now: DateTime<Utc>) -> DomainResult<Transition<Job, SagaAction>> {
    let mut job = Job::submitted(cmd, now)?;

    let request = SagaAction::send(
        Endpoint::JobType,
        JobMessage::SlotRequested(SlotRequested {
            job_id: job.job_id,
            job_type: cmd.job_type.clone(),
            concurrent_job_limit: cmd.concurrent_job_limit,
        }),
    );
    job.status = JobStatus::WaitingForSlot;

    Ok(Transition::changed(job, vec![request]))
}

/// Record the cancellation of a job not seen yet, so its submission cannot start it.
fn on_cancel_before_submit(
    event: &CancelRequested,
    now: DateTime<Utc>,
) -> Transition<Job, SagaAction> {
    let job = Job {
        job_id: event.job_id,
        job_type: None,
        payload: JsonValue::Null,
        status: JobStatus::Canceled,
        submitted_at: now,
        retry_count: 0,
        retry_policy: RetryPolicy::none(),
        max_attempt_duration: Duration::ZERO,
        attempt_ids: Vec::new(),
        active_attempt: None,
        result: None,
        fault_reason: None,
        cancel_reason: event.reason.clone(),
        finished_at: Some(now),
    };
    Transition::changed(job, Vec::new())
}

/// The submission of a job canceled ahead of it: keep it canceled and announce it.
fn on_submit_after_cancel(job: &Job, cmd: &SubmitJob) -> Transition<Job, SagaAction> {
    let mut job = job.clone();
    job.job_type = Some(cmd.job_type.clone());
    job.payload = cmd.payload.clone();
    job.retry_policy = cmd.retry_policy.clone();
    job.max_attempt_duration = cmd.max_attempt_duration;

    let notification = SagaAction::send(
        Endpoint::Notifications,
        JobMessage::JobCanceled(JobCanceled {
            job_id: job.job_id,
            job_type: cmd.job_type.clone(),
            reason: job.cancel_reason.clone(),
            canceled_at: job.finished_at.unwrap_or(job.submitted_at),
        }),
    );
    Transition::changed(job, vec![notification])
}

fn on_slot_granted(
    job: &Job,
    job_type: &JobTypeKey,
    now: DateTime<Utc>,
) -> Transition<Job, SagaAction> {
    match job.status {
        JobStatus::WaitingForSlot => {
            let mut job = job.clone();
            job.status = JobStatus::Running;
            let start = job.start_attempt(job_type, now);
            Transition::changed(job, vec![start])
        }
        // A grant racing a cancellation (or any terminal state) must hand the slot
        // back, otherwise it leaks.
        status if status.is_terminal() => {
            let release = job.release_slot(job_type);
            Transition::changed(job.clone(), vec![release])
        }
        _ => Transition::Ignored,
    }
}

fn on_attempt_completed(
    job: &Job,
    job_type: &JobTypeKey,
    event: &AttemptCompleted,
    now: DateTime<Utc>,
) -> Transition<Job, SagaAction> {
    if !job.is_active_attempt(event.attempt_id) {
        return Transition::Ignored;
    }

    let mut job = job.clone();
    job.result = Some(event.result.clone());
    job.finish(JobStatus::Completed, now);

    let notification = SagaAction::send(
        Endpoint::Notifications,
        JobMessage::JobCompleted(JobCompleted {
            job_id: job.job_id,
            job_type: job_type.clone(),
            attempt_id: event.attempt_id,
            result: event.result.clone(),
            completed_at: now,
        }),
    );
    let release = job.release_slot(job_type);

    Transition::changed(job, vec![release, notification])
}

fn on_attempt_faulted(
    job: &Job,
    job_type: &JobTypeKey,
    event: &AttemptFaulted,
    now: DateTime<Utc>,
) -> Transition<Job, SagaAction> {
    if !job.is_active_attempt(event.attempt_id) {
        return Transition::Ignored;
    }

    let mut job = job.clone();

    if job.retry_policy.should_retry(job.retry_count) {
        job.retry_count += 1;
        let delay = job.retry_policy.delay_for_retry(job.retry_count);
        let start = job.start_attempt(job_type, add_duration(now, delay));
        return Transition::changed(job, vec![start]);
    }

    job.fault_reason = Some(event.reason.clone());
    job.finish(JobStatus::Faulted, now);

    let notification = SagaAction::send(
        Endpoint::Notifications,
        JobMessage::JobFaulted(JobFaulted {
            job_id: job.job_id,
            job_type: job_type.clone(),
            reason: event.reason.clone(),
            attempts: job.attempt_ids.len() as u32,
            faulted_at: now,
        }),
    );
    let release = job.release_slot(job_type);

    Transition::changed(job, vec![release, notification])
}

fn on_cancel_requested(
    job: &Job,
    job_type: &JobTypeKey,
    event: &CancelRequested,
    now: DateTime<Utc>,
) -> Transition<Job, SagaAction> {
    if job.status.is_terminal() {
        return Transition::Ignored;
    }

    let mut actions = Vec::with_capacity(3);
    if let Some(attempt_id) = job.active_attempt {
        actions.push(SagaAction::send(
            Endpoint::JobAttempt,
            JobMessage::CancelAttempt(CancelAttempt {
                job_id: job.job_id,
                attempt_id,
                retry_number: job.retry_count,
                job_type: job_type.clone(),
            }),
        ));
    }
    // Releases a held slot, or withdraws the queued request while waiting.
    actions.push(job.release_slot(job_type));

    let mut job = job.clone();
    job.cancel_reason = event.reason.clone();
    job.finish(JobStatus::Canceled, now);

    actions.push(SagaAction::send(
        Endpoint::Notifications,
        JobMessage::JobCanceled(JobCanceled {
            job_id: job.job_id,
            job_type: job_type.clone(),
            reason: event.reason.clone(),
            canceled_at: now,
        }),
    ));

    Transition::changed(job, actions)
}
