//! Message dispatch for the state machine endpoints.
//!
//! The dispatcher is stateless. For each delivered envelope it:
//!
//! 1. Routes `(endpoint, message)` to one state machine event and correlation id
//! 2. Executes the event through that machine's [`SagaExecutor`]
//! 3. Performs the returned actions: sends, schedules, unschedules
//!
//! Granted slots become attempts and worker outcomes reach their job entirely through
//! these routed messages; the competing-consumer transport decides which node (and
//! which worker) handles each one.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error, info};

use jobservice_core::{DomainError, SagaInstance, Transition};
use jobservice_events::{Endpoint, Envelope, JobMessage, MessageBus, MessageScheduler, SagaAction};
use jobservice_jobs::{
    JobAttemptEvent, JobAttemptStateMachine, JobEvent, JobStateMachine, JobTypeEvent,
    JobTypeStateMachine,
};

use crate::saga::{SagaExecutor, SagaRepositories};
use crate::saga_repository::{SagaRecord, SagaRepositoryError};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Optimistic concurrency conflicts persisted past the retry limit.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error(transparent)]
    Repository(SagaRepositoryError),

    /// Performing an action failed after the instance was saved.
    #[error("failed to publish: {0}")]
    Publish(String),

    /// Deterministic failure from a state machine (validation, invariant).
    #[error(transparent)]
    Domain(DomainError),

    #[error("message {message_type} cannot be handled by endpoint {endpoint}")]
    Unroutable {
        endpoint: Endpoint,
        message_type: &'static str,
    },
}

impl DispatchError {
    /// Whether redelivering the same message could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DispatchError::Concurrency(_) | DispatchError::Repository(_) | DispatchError::Publish(_)
        )
    }
}

impl From<SagaRepositoryError> for DispatchError {
    fn from(value: SagaRepositoryError) -> Self {
        match value {
            SagaRepositoryError::Conflict(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Repository(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Conflict(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Domain(other),
        }
    }
}

/// A message resolved to the state machine event it drives.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    JobType(JobTypeEvent),
    Job(JobEvent),
    JobAttempt(JobAttemptEvent),
}

impl Route {
    /// Resolve a message delivered to `endpoint`.
    pub fn resolve(endpoint: &Endpoint, message: &JobMessage) -> Result<Self, DispatchError> {
        let route = match (endpoint, message) {
            (Endpoint::JobType, JobMessage::SlotRequested(m)) => {
                Route::JobType(JobTypeEvent::SlotRequested(m.clone()))
            }
            (Endpoint::JobType, JobMessage::SlotReleased(m)) => {
                Route::JobType(JobTypeEvent::SlotReleased(m.clone()))
            }
            (Endpoint::JobType, JobMessage::SetConcurrentJobLimit(m)) => {
                Route::JobType(JobTypeEvent::SetConcurrentJobLimit(m.clone()))
            }

            (Endpoint::Job, JobMessage::SubmitJob(m)) => Route::Job(JobEvent::Submit(m.clone())),
            (Endpoint::Job, JobMessage::SlotGranted(m)) => {
                Route::Job(JobEvent::SlotGranted(m.clone()))
            }
            (Endpoint::Job, JobMessage::AttemptCompleted(m)) => {
                Route::Job(JobEvent::AttemptCompleted(m.clone()))
            }
            (Endpoint::Job, JobMessage::AttemptFaulted(m)) => {
                Route::Job(JobEvent::AttemptFaulted(m.clone()))
            }
            (Endpoint::Job, JobMessage::AttemptCanceled(m)) => {
                Route::Job(JobEvent::AttemptCanceled(m.clone()))
            }
            (Endpoint::Job, JobMessage::CancelRequested(m)) => {
                Route::Job(JobEvent::CancelRequested(m.clone()))
            }

            (Endpoint::JobAttempt, JobMessage::StartAttempt(m)) => {
                Route::JobAttempt(JobAttemptEvent::Start(m.clone()))
            }
            (Endpoint::JobAttempt, JobMessage::AttemptCompleted(m)) => {
                Route::JobAttempt(JobAttemptEvent::Completed(m.clone()))
            }
            (Endpoint::JobAttempt, JobMessage::AttemptFaulted(m)) => {
                Route::JobAttempt(JobAttemptEvent::Faulted(m.clone()))
            }
            (Endpoint::JobAttempt, JobMessage::AttemptTimeoutExpired(m)) => {
                Route::JobAttempt(JobAttemptEvent::TimeoutExpired(m.clone()))
            }
            (Endpoint::JobAttempt, JobMessage::CancelAttempt(m)) => {
                Route::JobAttempt(JobAttemptEvent::Cancel(m.clone()))
            }

            (endpoint, message) => {
                return Err(DispatchError::Unroutable {
                    endpoint: endpoint.clone(),
                    message_type: message.message_type(),
                });
            }
        };
        Ok(route)
    }
}

/// Result of dispatching one envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The machine ignored the message (duplicate, stale, or unknown instance).
    Ignored,
    /// The instance was saved and `actions` actions were performed.
    Applied {
        saga_type: &'static str,
        state: &'static str,
        version: u64,
        actions: usize,
    },
}

/// Routes messages from the state machine endpoints into their machines.
pub struct Dispatcher<B, S> {
    job_types: SagaExecutor<JobTypeStateMachine>,
    jobs: SagaExecutor<JobStateMachine>,
    attempts: SagaExecutor<JobAttemptStateMachine>,
    bus: B,
    scheduler: S,
}

impl<B, S> Dispatcher<B, S> {
    pub fn new(
        repositories: &SagaRepositories,
        bus: B,
        scheduler: S,
        conflict_retry_limit: u32,
    ) -> Self {
        Self {
            job_types: SagaExecutor::new(repositories.job_types.clone(), conflict_retry_limit),
            jobs: SagaExecutor::new(repositories.jobs.clone(), conflict_retry_limit),
            attempts: SagaExecutor::new(repositories.attempts.clone(), conflict_retry_limit),
            bus,
            scheduler,
        }
    }
}

impl<B, S> Dispatcher<B, S>
where
    B: MessageBus,
    S: MessageScheduler,
{
    /// Handle one envelope delivered to a state machine endpoint.
    pub fn dispatch(
        &self,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let endpoint = envelope.endpoint();
        let message = envelope.message();
        debug!(
            endpoint = %endpoint,
            message_type = message.message_type(),
            message_id = %envelope.message_id(),
            "dispatching message"
        );

        match Route::resolve(endpoint, message)? {
            Route::JobType(event) => {
                let id = event.correlation_id().clone();
                let transition = self.job_types.execute(&id, &event, now)?;
                self.complete(transition, now)
            }
            Route::Job(event) => {
                let transition = self.jobs.execute(&event.correlation_id(), &event, now)?;
                self.complete(transition, now)
            }
            Route::JobAttempt(event) => {
                let transition = self.attempts.execute(&event.correlation_id(), &event, now)?;
                self.complete(transition, now)
            }
        }
    }

    fn complete<I: SagaInstance>(
        &self,
        transition: Transition<SagaRecord<I>, SagaAction>,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, DispatchError> {
        let Transition::Changed { instance: record, actions } = transition else {
            return Ok(DispatchOutcome::Ignored);
        };

        info!(
            saga_type = I::saga_type(),
            correlation_id = %record.instance.correlation_id(),
            state = record.instance.state_tag(),
            version = record.version,
            actions = actions.len(),
            "saga transitioned"
        );

        let count = actions.len();
        let mut actions = actions.into_iter();
        while let Some(action) = actions.next() {
            if let Err(err) = self.perform(action, now) {
                // The instance is saved; a redelivery will not produce these again.
                let unperformed: Vec<SagaAction> = actions.by_ref().collect();
                error!(
                    saga_type = I::saga_type(),
                    correlation_id = %record.instance.correlation_id(),
                    state = record.instance.state_tag(),
                    error = %err,
                    unperformed = ?unperformed,
                    "action failed after the saga was saved"
                );
                return Err(err);
            }
        }

        Ok(DispatchOutcome::Applied {
            saga_type: I::saga_type(),
            state: record.instance.state_tag(),
            version: record.version,
            actions: count,
        })
    }

    fn perform(&self, action: SagaAction, now: DateTime<Utc>) -> Result<(), DispatchError> {
        match action {
            SagaAction::Send { endpoint, message } => {
                debug!(endpoint = %endpoint, message_type = message.message_type(), "send");
                self.bus
                    .send(Envelope::new(endpoint, message, now))
                    .map_err(|e| DispatchError::Publish(e.to_string()))
            }
            SagaAction::Schedule {
                schedule_id,
                deliver_at,
                endpoint,
                message,
            } => {
                debug!(
                    schedule_id = %schedule_id,
                    deliver_at = %deliver_at,
                    endpoint = %endpoint,
                    message_type = message.message_type(),
                    "schedule"
                );
                self.scheduler
                    .schedule(schedule_id, deliver_at, Envelope::new(endpoint, message, now))
                    .map_err(|e| DispatchError::Publish(e.to_string()))
            }
            SagaAction::Unschedule { schedule_id } => {
                let removed = self
                    .scheduler
                    .unschedule(&schedule_id)
                    .map_err(|e| DispatchError::Publish(e.to_string()))?;
                debug!(schedule_id = %schedule_id, removed, "unschedule");
                Ok(())
            }
        }
    }
}
