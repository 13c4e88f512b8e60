use std::collections::HashMap;
use std::sync::RwLock;

use jobservice_core::{ExpectedVersion, SagaInstance};

use super::r#trait::{SagaRecord, SagaRepository, SagaRepositoryError};

/// In-memory saga repository.
///
/// Intended for tests/dev and single-process nodes. Shared between service
/// instances through an `Arc` to simulate several nodes over one store.
#[derive(Debug)]
pub struct InMemorySagaRepository<I: SagaInstance> {
    records: RwLock<HashMap<I::Id, SagaRecord<I>>>,
}

impl<I: SagaInstance> Default for InMemorySagaRepository<I> {
    fn default() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }
}

impl<I: SagaInstance> InMemorySagaRepository<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored instance (unordered).
    pub fn instances(&self) -> Result<Vec<SagaRecord<I>>, SagaRepositoryError> {
        let records = self
            .records
            .read()
            .map_err(|_| SagaRepositoryError::Storage("lock poisoned".to_string()))?;
        Ok(records.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<I: SagaInstance> SagaRepository<I> for InMemorySagaRepository<I> {
    fn load(&self, id: &I::Id) -> Result<Option<SagaRecord<I>>, SagaRepositoryError> {
        let records = self
            .records
            .read()
            .map_err(|_| SagaRepositoryError::Storage("lock poisoned".to_string()))?;
        Ok(records.get(id).cloned())
    }

    fn save(&self, instance: &I, expected: ExpectedVersion) -> Result<u64, SagaRepositoryError> {
        let id = instance.correlation_id();
        let mut records = self
            .records
            .write()
            .map_err(|_| SagaRepositoryError::Storage("lock poisoned".to_string()))?;

        let current = records.get(&id).map(|r| r.version);
        if !expected.matches(current) {
            return Err(SagaRepositoryError::Conflict(format!(
                "{} {id}: expected {expected:?}, found {current:?}",
                I::saga_type()
            )));
        }

        let version = current.unwrap_or(0) + 1;
        records.insert(
            id,
            SagaRecord {
                instance: instance.clone(),
                version,
            },
        );
        Ok(version)
    }
}
