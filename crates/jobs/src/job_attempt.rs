//! Job attempt lifecycle: one execution try of a job.
//!
//! ```text
//! Started -> Completed | Faulted | Canceled | TimedOut
//! ```
//!
//! The attempt is the idempotence boundary for worker results. Workers report to the
//! attempt, and the attempt forwards an outcome to its job only when it accepted it.
//! A result arriving after the timeout fired (or after cancellation) is dropped here.
//! A cancellation handled before its start leaves a canceled attempt behind, so the
//! start arriving afterwards is dropped too.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobservice_core::{
    AttemptId, DomainResult, JobId, JobTypeKey, SagaInstance, StateMachine, Transition,
};
use jobservice_events::{
    AttemptCanceled, AttemptCompleted, AttemptFaulted, AttemptTimeoutExpired, CancelAttempt,
    Endpoint, ExecuteAttempt, JobMessage, SagaAction, ScheduleId, StartAttempt,
};

use crate::add_duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Started,
    Completed,
    Faulted,
    Canceled,
    TimedOut,
}

impl AttemptStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, AttemptStatus::Started)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Started => "Started",
            AttemptStatus::Completed => "Completed",
            AttemptStatus::Faulted => "Faulted",
            AttemptStatus::Canceled => "Canceled",
            AttemptStatus::TimedOut => "TimedOut",
        }
    }
}

/// Persisted attempt instance. Immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobAttempt {
    attempt_id: AttemptId,
    job_id: JobId,
    job_type: JobTypeKey,
    retry_number: u32,
    status: AttemptStatus,
    started_at: DateTime<Utc>,
    deadline: DateTime<Utc>,
    max_duration: Duration,
    result: Option<JsonValue>,
    fault_reason: Option<String>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobAttempt {
    pub fn attempt_id(&self) -> AttemptId {
        self.attempt_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_type(&self) -> &JobTypeKey {
        &self.job_type
    }

    pub fn retry_number(&self) -> u32 {
        self.retry_number
    }

    pub fn status(&self) -> AttemptStatus {
        self.status
    }

    /// When execution begins (after any retry backoff).
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn result(&self) -> Option<&JsonValue> {
        self.result.as_ref()
    }

    pub fn fault_reason(&self) -> Option<&str> {
        self.fault_reason.as_deref()
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    fn finish(&mut self, status: AttemptStatus, now: DateTime<Utc>) {
        self.status = status;
        self.finished_at = Some(now);
    }

    fn timeout_id(&self) -> ScheduleId {
        ScheduleId::attempt_timeout(self.attempt_id)
    }
}

impl SagaInstance for JobAttempt {
    type Id = AttemptId;

    fn saga_type() -> &'static str {
        "jobservice.job_attempt"
    }

    fn correlation_id(&self) -> Self::Id {
        self.attempt_id
    }

    fn state_tag(&self) -> &'static str {
        self.status.as_str()
    }
}

/// Events consumed by the attempt machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobAttemptEvent {
    Start(StartAttempt),
    Completed(AttemptCompleted),
    Faulted(AttemptFaulted),
    TimeoutExpired(AttemptTimeoutExpired),
    Cancel(CancelAttempt),
}

impl JobAttemptEvent {
    pub fn correlation_id(&self) -> AttemptId {
        match self {
            JobAttemptEvent::Start(e) => e.attempt_id,
            JobAttemptEvent::Completed(e) => e.attempt_id,
            JobAttemptEvent::Faulted(e) => e.attempt_id,
            JobAttemptEvent::TimeoutExpired(e) => e.attempt_id,
            JobAttemptEvent::Cancel(e) => e.attempt_id,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JobAttemptStateMachine;

impl StateMachine for JobAttemptStateMachine {
    type Instance = JobAttempt;
    type Event = JobAttemptEvent;
    type Action = SagaAction;

    fn transition(
        current: Option<&JobAttempt>,
        event: &JobAttemptEvent,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition<JobAttempt, SagaAction>> {
        let attempt = match (current, event) {
            (None, JobAttemptEvent::Start(cmd)) => return Ok(on_start(cmd, now)),
            (None, JobAttemptEvent::Cancel(cmd)) => return Ok(on_cancel_before_start(cmd, now)),
            (Some(attempt), _) if attempt.status == AttemptStatus::Started => attempt,
            // Duplicate start, unknown attempt, or already terminal.
            _ => return Ok(Transition::Ignored),
        };

        let transition = match event {
            JobAttemptEvent::Start(_) => Transition::Ignored,
            JobAttemptEvent::Completed(e) if e.job_id == attempt.job_id => {
                on_completed(attempt, e, now)
            }
            JobAttemptEvent::Faulted(e) if e.job_id == attempt.job_id => {
                on_faulted(attempt, e, now)
            }
            JobAttemptEvent::TimeoutExpired(_) => on_timeout(attempt, now),
            JobAttemptEvent::Cancel(_) => on_cancel(attempt, now),
            // Outcome reported under the wrong job.
            JobAttemptEvent::Completed(_) | JobAttemptEvent::Faulted(_) => Transition::Ignored,
        };
        Ok(transition)
    }
}

fn on_start(cmd: &StartAttempt, now: DateTime<Utc>) -> Transition<JobAttempt, SagaAction> {
    let started_at = cmd.not_before.max(now);
    let deadline = add_duration(started_at, cmd.max_duration);

    let attempt = JobAttempt {
        attempt_id: cmd.attempt_id,
        job_id: cmd.job_id,
        job_type: cmd.job_type.clone(),
        retry_number: cmd.retry_number,
        status: AttemptStatus::Started,
        started_at,
        deadline,
        max_duration: cmd.max_duration,
        result: None,
        fault_reason: None,
        finished_at: None,
    };

    let endpoint = Endpoint::JobConsumer(cmd.job_type.clone());
    let work = JobMessage::ExecuteAttempt(ExecuteAttempt {
        job_id: cmd.job_id,
        attempt_id: cmd.attempt_id,
        retry_number: cmd.retry_number,
        job_type: cmd.job_type.clone(),
        payload: cmd.payload.clone(),
        deadline,
    });

    let execute = if cmd.not_before > now {
        SagaAction::Schedule {
            schedule_id: ScheduleId::attempt_execution(cmd.attempt_id),
            deliver_at: cmd.not_before,
            endpoint,
            message: work,
        }
    } else {
        SagaAction::send(endpoint, work)
    };

    let timeout = SagaAction::Schedule {
        schedule_id: attempt.timeout_id(),
        deliver_at: deadline,
        endpoint: Endpoint::JobAttempt,
        message: JobMessage::AttemptTimeoutExpired(AttemptTimeoutExpired {
            attempt_id: cmd.attempt_id,
        }),
    };

    Transition::changed(attempt, vec![execute, timeout])
}

fn on_cancel_before_start(
    cmd: &CancelAttempt,
    now: DateTime<Utc>,
) -> Transition<JobAttempt, SagaAction> {
    let attempt = JobAttempt {
        attempt_id: cmd.attempt_id,
        job_id: cmd.job_id,
        job_type: cmd.job_type.clone(),
        retry_number: cmd.retry_number,
        status: AttemptStatus::Canceled,
        started_at: now,
        deadline: now,
        max_duration: Duration::ZERO,
        result: None,
        fault_reason: None,
        finished_at: Some(now),
    };
    // The job is canceled already; nothing was scheduled for the attempt yet.
    Transition::changed(attempt, Vec::new())
}

fn on_completed(
    attempt: &JobAttempt,
    event: &AttemptCompleted,
    now: DateTime<Utc>,
) -> Transition<JobAttempt, SagaAction> {
    let mut attempt = attempt.clone();
    attempt.result = Some(event.result.clone());
    attempt.finish(AttemptStatus::Completed, now);

    let actions = vec![
        SagaAction::Unschedule {
            schedule_id: attempt.timeout_id(),
        },
        SagaAction::send(Endpoint::Job, JobMessage::AttemptCompleted(event.clone())),
    ];
    Transition::changed(attempt, actions)
}

fn on_faulted(
    attempt: &JobAttempt,
    event: &AttemptFaulted,
    now: DateTime<Utc>,
) -> Transition<JobAttempt, SagaAction> {
    let mut attempt = attempt.clone();
    attempt.fault_reason = Some(event.reason.clone());
    attempt.finish(AttemptStatus::Faulted, now);

    let actions = vec![
        SagaAction::Unschedule {
            schedule_id: attempt.timeout_id(),
        },
        SagaAction::send(
            Endpoint::Job,
            JobMessage::AttemptFaulted(AttemptFaulted {
                timed_out: false,
                ..event.clone()
            }),
        ),
    ];
    Transition::changed(attempt, actions)
}

/// A timeout is reported to the job as a fault, so it consumes a retry.
fn on_timeout(attempt: &JobAttempt, now: DateTime<Utc>) -> Transition<JobAttempt, SagaAction> {
    let reason = format!(
        "attempt exceeded its maximum duration of {}ms",
        attempt.max_duration.as_millis()
    );

    let mut attempt = attempt.clone();
    attempt.fault_reason = Some(reason.clone());
    attempt.finish(AttemptStatus::TimedOut, now);

    let fault = SagaAction::send(
        Endpoint::Job,
        JobMessage::AttemptFaulted(AttemptFaulted {
            job_id: attempt.job_id,
            attempt_id: attempt.attempt_id,
            reason,
            timed_out: true,
        }),
    );
    Transition::changed(attempt, vec![fault])
}

fn on_cancel(attempt: &JobAttempt, now: DateTime<Utc>) -> Transition<JobAttempt, SagaAction> {
    let mut attempt = attempt.clone();
    attempt.finish(AttemptStatus::Canceled, now);

    let actions = vec![
        SagaAction::Unschedule {
            schedule_id: attempt.timeout_id(),
        },
        SagaAction::Unschedule {
            schedule_id: ScheduleId::attempt_execution(attempt.attempt_id),
        },
        SagaAction::send(
            Endpoint::Job,
            JobMessage::AttemptCanceled(AttemptCanceled {
                job_id: attempt.job_id,
                attempt_id: attempt.attempt_id,
            }),
        ),
    ];
    Transition::changed(attempt, actions)
}
