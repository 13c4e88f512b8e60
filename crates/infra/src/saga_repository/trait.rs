use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobservice_core::{ExpectedVersion, SagaInstance};

/// A loaded instance together with the version it was stored at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord<I> {
    pub instance: I,
    /// Starts at 1 on insert and increases by one per save.
    pub version: u64,
}

/// Saga repository operation error.
///
/// These are **infrastructure errors**; deterministic domain failures are reported
/// by the state machines as `DomainError`.
#[derive(Debug, Error)]
pub enum SagaRepositoryError {
    /// Optimistic concurrency check failed (another writer saved first).
    #[error("optimistic concurrency check failed: {0}")]
    Conflict(String),

    #[error("saga instance not found: {0}")]
    NotFound(String),

    #[error("saga instance (de)serialization failed: {0}")]
    Serialization(String),

    #[error("saga storage failure: {0}")]
    Storage(String),
}

impl SagaRepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaRepositoryError::Conflict(_))
    }
}

/// Keyed, versioned store of one kind of saga instance.
///
/// ## Save Semantics
///
/// `save()`:
/// - Checks `expected` against the stored version (`None` when absent)
/// - Writes the instance and its state tag
/// - Returns the new version (`previous + 1`, or `1` for a new instance)
///
/// Implementations must make the check-and-write atomic per correlation id.
/// Instances are never deleted by the job service.
pub trait SagaRepository<I: SagaInstance>: Send + Sync {
    fn load(&self, id: &I::Id) -> Result<Option<SagaRecord<I>>, SagaRepositoryError>;

    fn save(&self, instance: &I, expected: ExpectedVersion) -> Result<u64, SagaRepositoryError>;

    /// Store a new instance; fails with `Conflict` if one already exists.
    fn insert(&self, instance: &I) -> Result<u64, SagaRepositoryError> {
        self.save(instance, ExpectedVersion::NoInstance)
    }
}

impl<I, R> SagaRepository<I> for Arc<R>
where
    I: SagaInstance,
    R: SagaRepository<I> + ?Sized,
{
    fn load(&self, id: &I::Id) -> Result<Option<SagaRecord<I>>, SagaRepositoryError> {
        (**self).load(id)
    }

    fn save(&self, instance: &I, expected: ExpectedVersion) -> Result<u64, SagaRepositoryError> {
        (**self).save(instance, expected)
    }
}
