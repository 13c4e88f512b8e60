//! Message boundary of the job service.
//!
//! Messages, logical endpoints, envelopes, outbound saga actions, and the transport
//! abstractions (bus + scheduler) the state machines are driven through.

pub mod action;
pub mod bus;
pub mod endpoint;
pub mod envelope;
pub mod in_memory_bus;
pub mod in_memory_scheduler;
pub mod message;
pub mod scheduler;

pub use action::{SagaAction, ScheduleId};
pub use bus::{MessageBus, Subscription};
pub use endpoint::Endpoint;
pub use envelope::Envelope;
pub use in_memory_bus::{InMemoryBusError, InMemoryMessageBus};
pub use in_memory_scheduler::InMemoryMessageScheduler;
pub use message::*;
pub use scheduler::MessageScheduler;
