//! Message transport abstraction (mechanics only).
//!
//! The bus is intentionally **lightweight** and makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels, a broker, a database queue, etc.
//! - **At-least-once delivery**: messages may be delivered more than once; consumers
//!   must be idempotent
//! - **Competing consumers**: each message sent to an endpoint is handled by exactly
//!   one of the consumers subscribed to that endpoint
//! - **No persistence**: the saga repository is the source of truth, not the bus
//!
//! The job state machines are built for this contract: a duplicate `SlotGranted`,
//! `AttemptCompleted`, or `AttemptFaulted` is recognised from the persisted
//! instance and ignored.

use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::endpoint::Endpoint;
use crate::envelope::Envelope;

/// A consumer's handle on one endpoint.
///
/// Clones of a subscription (and further subscriptions to the same endpoint) compete
/// for messages: each message is received by exactly one of them.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe(&Endpoint::Job);
///
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(envelope) => handle(envelope)?,
///         Err(RecvTimeoutError::Timeout) => continue,   // Check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break, // Bus closed
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Arc<Mutex<Receiver<M>>>,
}

impl<M> Clone for Subscription<M> {
    fn clone(&self) -> Self {
        Self {
            receiver: Arc::clone(&self.receiver),
        }
    }
}

impl<M> Subscription<M> {
    pub fn new(receiver: Arc<Mutex<Receiver<M>>>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        let receiver = self.receiver.lock().map_err(|_| RecvError)?;
        receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| TryRecvError::Disconnected)?;
        receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| RecvTimeoutError::Disconnected)?;
        receiver.recv_timeout(timeout)
    }
}

/// Endpoint-addressed message bus.
///
/// ## Delivery Guarantees
///
/// - Messages may be delivered multiple times (redelivery after a consumer crash)
/// - Messages to the same endpoint are delivered in send order per consumer; there is
///   no ordering across endpoints
///
/// ## Error Handling
///
/// `send()` can fail (e.g. broker unavailable). Failures are surfaced to the caller,
/// which keeps the triggering message unacknowledged so the transport redelivers it.
pub trait MessageBus: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn send(&self, envelope: Envelope) -> Result<(), Self::Error>;

    fn subscribe(&self, endpoint: &Endpoint) -> Subscription<Envelope>;
}

impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    type Error = B::Error;

    fn send(&self, envelope: Envelope) -> Result<(), Self::Error> {
        (**self).send(envelope)
    }

    fn subscribe(&self, endpoint: &Endpoint) -> Subscription<Envelope> {
        (**self).subscribe(endpoint)
    }
}
