//! Saga instance persistence boundary.
//!
//! Each state machine instance is stored as one versioned record keyed by its
//! correlation id. Saves carry an [`ExpectedVersion`](jobservice_core::ExpectedVersion);
//! a stale writer gets [`SagaRepositoryError::Conflict`] and must reload and retry.
//! This compare-and-swap is the only lock discipline in the job service.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemorySagaRepository;
#[cfg(feature = "postgres")]
pub use postgres::PostgresSagaRepository;
pub use r#trait::{SagaRecord, SagaRepository, SagaRepositoryError};
