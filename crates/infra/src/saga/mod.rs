//! Saga execution: load → transition → save (optimistic) → hand back actions.
//!
//! ```text
//! Event for correlation id
//!   ↓
//! 1. Load the instance and its version (None if absent)
//!   ↓
//! 2. Transition (pure; may create the instance, ignore the event, or fail validation)
//!   ↓
//! 3. Save with ExpectedVersion (NoInstance | Exact(loaded version))
//!   ↓ conflict? → reload and go to 2 (bounded)
//! 4. Return the saved record and the actions to perform
//! ```
//!
//! Actions are returned rather than performed here so that the caller performs them
//! strictly after the save succeeded.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use jobservice_core::{DomainError, ExpectedVersion, SagaInstance, StateMachine, Transition};
use jobservice_jobs::{Job, JobAttempt, JobType};

use crate::dispatcher::DispatchError;
use crate::saga_repository::{InMemorySagaRepository, SagaRecord, SagaRepository};

/// The three saga repositories a job service node works against.
///
/// Nodes that share one set of repositories (and one transport) cooperate as
/// competing consumers.
#[derive(Clone)]
pub struct SagaRepositories {
    pub job_types: Arc<dyn SagaRepository<JobType>>,
    pub jobs: Arc<dyn SagaRepository<Job>>,
    pub attempts: Arc<dyn SagaRepository<JobAttempt>>,
}

impl SagaRepositories {
    pub fn new(
        job_types: Arc<dyn SagaRepository<JobType>>,
        jobs: Arc<dyn SagaRepository<Job>>,
        attempts: Arc<dyn SagaRepository<JobAttempt>>,
    ) -> Self {
        Self {
            job_types,
            jobs,
            attempts,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemorySagaRepository::<JobType>::new()),
            Arc::new(InMemorySagaRepository::<Job>::new()),
            Arc::new(InMemorySagaRepository::<JobAttempt>::new()),
        )
    }
}

impl core::fmt::Debug for SagaRepositories {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SagaRepositories").finish_non_exhaustive()
    }
}

/// Applies events to the instances of one state machine.
pub struct SagaExecutor<M: StateMachine> {
    repository: Arc<dyn SagaRepository<M::Instance>>,
    conflict_retry_limit: u32,
    _machine: PhantomData<fn() -> M>,
}

impl<M: StateMachine> Clone for SagaExecutor<M> {
    fn clone(&self) -> Self {
        Self {
            repository: Arc::clone(&self.repository),
            conflict_retry_limit: self.conflict_retry_limit,
            _machine: PhantomData,
        }
    }
}

impl<M: StateMachine> SagaExecutor<M> {
    pub fn new(
        repository: Arc<dyn SagaRepository<M::Instance>>,
        conflict_retry_limit: u32,
    ) -> Self {
        Self {
            repository,
            conflict_retry_limit,
            _machine: PhantomData,
        }
    }

    pub fn repository(&self) -> &Arc<dyn SagaRepository<M::Instance>> {
        &self.repository
    }

    /// Apply `event` to the instance `id`.
    ///
    /// Returns `Transition::Ignored` when the machine ignored the event (nothing was
    /// saved), otherwise the saved record and the actions to perform. A conflict
    /// that persists past the retry limit is returned as `DispatchError::Concurrency`
    /// so the transport can redeliver the event later.
    #[instrument(
        skip(self, event, now),
        fields(saga_type = <M::Instance as SagaInstance>::saga_type(), correlation_id = %id),
        err
    )]
    pub fn execute(
        &self,
        id: &<M::Instance as SagaInstance>::Id,
        event: &M::Event,
        now: DateTime<Utc>,
    ) -> Result<Transition<SagaRecord<M::Instance>, M::Action>, DispatchError> {
        let mut conflicts = 0u32;

        loop {
            let current = self.repository.load(id)?;

            let transition = M::transition(current.as_ref().map(|r| &r.instance), event, now)?;
            let (instance, actions) = match transition {
                Transition::Ignored => {
                    debug!(state = current.as_ref().map(|r| r.instance.state_tag()), "event ignored");
                    return Ok(Transition::Ignored);
                }
                Transition::Changed { instance, actions } => (instance, actions),
            };

            if instance.correlation_id() != *id {
                return Err(DispatchError::Domain(DomainError::invariant(format!(
                    "transition produced instance {} for correlation id {id}",
                    instance.correlation_id()
                ))));
            }

            let expected = current
                .as_ref()
                .map_or(ExpectedVersion::NoInstance, |r| ExpectedVersion::Exact(r.version));

            match self.repository.save(&instance, expected) {
                Ok(version) => {
                    debug!(state = instance.state_tag(), version, "saga instance saved");
                    return Ok(Transition::changed(SagaRecord { instance, version }, actions));
                }
                Err(err) if err.is_conflict() && conflicts < self.conflict_retry_limit => {
                    conflicts += 1;
                    debug!(attempt = conflicts, error = %err, "save conflict, reloading");
                }
                Err(err) if err.is_conflict() => {
                    warn!(conflicts, error = %err, "save conflict retries exhausted");
                    return Err(DispatchError::Concurrency(err.to_string()));
                }
                Err(err) => return Err(DispatchError::Repository(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use jobservice_core::{JobId, JobTypeKey};
    use jobservice_events::{SlotRequested, SagaAction};
    use jobservice_jobs::{JobTypeEvent, JobTypeStateMachine};

    use super::*;
    use crate::saga_repository::SagaRepositoryError;

    fn request(job_id: JobId) -> JobTypeEvent {
        JobTypeEvent::SlotRequested(SlotRequested {
            job_id,
            job_type: JobTypeKey::new("export").unwrap(),
            concurrent_job_limit: 1,
        })
    }

    /// Fails the first `conflicts` saves with a conflict, then delegates.
    struct ConflictingRepository {
        inner: InMemorySagaRepository<JobType>,
        conflicts: AtomicU32,
    }

    impl SagaRepository<JobType> for ConflictingRepository {
        fn load(&self, id: &JobTypeKey) -> Result<Option<SagaRecord<JobType>>, SagaRepositoryError> {
            self.inner.load(id)
        }

        fn save(&self, instance: &JobType, expected: ExpectedVersion) -> Result<u64, SagaRepositoryError> {
            if self.conflicts.load(Ordering::SeqCst) > 0 {
                self.conflicts.fetch_sub(1, Ordering::SeqCst);
                return Err(SagaRepositoryError::Conflict("simulated".to_string()));
            }
            self.inner.save(instance, expected)
        }
    }

    #[test]
    fn creates_then_updates_instance() {
        let repo = Arc::new(InMemorySagaRepository::<JobType>::new());
        let executor = SagaExecutor::<JobTypeStateMachine>::new(repo.clone(), 3);
        let key = JobTypeKey::new("export").unwrap();

        let first = executor.execute(&key, &request(JobId::new()), Utc::now()).unwrap();
        assert_eq!(first.instance().map(|r| r.version), Some(1));
        assert_eq!(first.actions().len(), 1);

        let second = executor.execute(&key, &request(JobId::new()), Utc::now()).unwrap();
        assert_eq!(second.instance().map(|r| r.version), Some(2));
        assert!(second.actions().is_empty(), "queued behind the first job");
    }

    #[test]
    fn conflicts_are_retried_against_reloaded_instance() {
        let repo = Arc::new(ConflictingRepository {
            inner: InMemorySagaRepository::new(),
            conflicts: AtomicU32::new(2),
        });
        let executor = SagaExecutor::<JobTypeStateMachine>::new(repo.clone(), 3);
        let key = JobTypeKey::new("export").unwrap();

        let result = executor.execute(&key, &request(JobId::new()), Utc::now()).unwrap();
        assert!(matches!(
            result.actions(),
            [SagaAction::Send { .. }]
        ));
        assert_eq!(repo.inner.len(), 1);
    }

    #[test]
    fn exhausted_conflict_retries_surface_as_concurrency_error() {
        let repo = Arc::new(ConflictingRepository {
            inner: InMemorySagaRepository::new(),
            conflicts: AtomicU32::new(10),
        });
        let executor = SagaExecutor::<JobTypeStateMachine>::new(repo, 2);
        let key = JobTypeKey::new("export").unwrap();

        let err = executor.execute(&key, &request(JobId::new()), Utc::now()).unwrap_err();
        assert!(matches!(err, DispatchError::Concurrency(_)));
    }

    #[test]
    fn validation_errors_are_not_retried() {
        let repo = Arc::new(InMemorySagaRepository::<JobType>::new());
        let executor = SagaExecutor::<JobTypeStateMachine>::new(repo.clone(), 3);
        let key = JobTypeKey::new("export").unwrap();
        let event = JobTypeEvent::SlotRequested(SlotRequested {
            job_id: JobId::new(),
            job_type: key.clone(),
            concurrent_job_limit: 0,
        });

        let err = executor.execute(&key, &event, Utc::now()).unwrap_err();
        assert!(matches!(err, DispatchError::Domain(DomainError::Validation(_))));
        assert!(repo.is_empty());
    }
}
