//! Saga instance and state machine contracts.
//!
//! A saga instance is a persisted, versioned record (state tag + attributes) keyed
//! by a correlation id. A state machine advances one instance per event through a
//! pure transition function:
//!
//! ```text
//! (current instance?, event, now) -> Ignored | Changed { new instance, actions }
//! ```
//!
//! Transitions never perform IO. Outbound effects are returned as data (`actions`)
//! and carried out by infrastructure only after the new instance was saved.

use chrono::{DateTime, Utc};

use crate::error::{DomainError, DomainResult};

/// Optimistic concurrency expectation for a saga instance.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// Skip version checking.
    Any,
    /// The instance must not exist yet.
    NoInstance,
    /// Require the instance to be at an exact version.
    Exact(u64),
}

impl ExpectedVersion {
    /// `actual` is `None` when no instance is stored for the correlation id.
    pub fn matches(self, actual: Option<u64>) -> bool {
        match (self, actual) {
            (ExpectedVersion::Any, _) => true,
            (ExpectedVersion::NoInstance, None) => true,
            (ExpectedVersion::Exact(v), Some(a)) => v == a,
            _ => false,
        }
    }

    pub fn check(self, actual: Option<u64>) -> DomainResult<()> {
        if self.matches(actual) {
            Ok(())
        } else {
            Err(DomainError::conflict(format!(
                "optimistic concurrency check failed (expected: {self:?}, actual: {actual:?})"
            )))
        }
    }
}

/// A persisted state machine instance.
pub trait SagaInstance: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Correlation id used to load and version the instance.
    type Id: Clone
        + Eq
        + core::hash::Hash
        + core::fmt::Debug
        + core::fmt::Display
        + Send
        + Sync
        + 'static;

    /// Stable saga type identifier (e.g. `"jobservice.job"`).
    fn saga_type() -> &'static str;

    fn correlation_id(&self) -> Self::Id;

    /// Name of the current state, persisted next to the attributes.
    fn state_tag(&self) -> &'static str;
}

/// Result of applying one event to one instance.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<I, A> {
    /// The event does not apply to the current state (duplicate, stale, or
    /// addressed to an instance that does not exist). Nothing is saved or emitted.
    Ignored,
    /// Save `instance`, then perform `actions` in order.
    Changed { instance: I, actions: Vec<A> },
}

impl<I, A> Transition<I, A> {
    pub fn changed(instance: I, actions: Vec<A>) -> Self {
        Transition::Changed { instance, actions }
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, Transition::Ignored)
    }

    pub fn instance(&self) -> Option<&I> {
        match self {
            Transition::Ignored => None,
            Transition::Changed { instance, .. } => Some(instance),
        }
    }

    pub fn actions(&self) -> &[A] {
        match self {
            Transition::Ignored => &[],
            Transition::Changed { actions, .. } => actions,
        }
    }
}

/// State machine semantics (pure, deterministic).
///
/// `current` is `None` when no instance exists for the event's correlation id; the
/// machine decides whether the event creates one. `now` is supplied by the caller so
/// transitions stay reproducible.
pub trait StateMachine: Send + Sync + 'static {
    type Instance: SagaInstance;
    type Event: Clone + core::fmt::Debug + Send + Sync;
    type Action: Clone + core::fmt::Debug + Send + Sync;

    fn transition(
        current: Option<&Self::Instance>,
        event: &Self::Event,
        now: DateTime<Utc>,
    ) -> DomainResult<Transition<Self::Instance, Self::Action>>;
}
