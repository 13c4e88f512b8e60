//! In-memory competing-consumer bus for tests/dev and single-process nodes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, mpsc};

use thiserror::Error;

use crate::bus::{MessageBus, Subscription};
use crate::endpoint::Endpoint;
use crate::envelope::Envelope;

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
    #[error("endpoint {0} is disconnected")]
    Disconnected(Endpoint),
}

#[derive(Debug)]
struct EndpointQueue {
    sender: mpsc::Sender<Envelope>,
    receiver: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

impl EndpointQueue {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }
}

/// In-memory bus with one queue per endpoint.
///
/// - No IO / no async
/// - Messages sent before anyone subscribed are kept until a consumer arrives
/// - All subscriptions to an endpoint share a single receiver (competing consumers)
#[derive(Debug, Default)]
pub struct InMemoryMessageBus {
    queues: Mutex<HashMap<Endpoint, EndpointQueue>>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl MessageBus for InMemoryMessageBus {
    type Error = InMemoryBusError;

    fn send(&self, envelope: Envelope) -> Result<(), Self::Error> {
        let mut queues = self.queues.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let queue = queues
            .entry(envelope.endpoint().clone())
            .or_insert_with(EndpointQueue::new);

        queue
            .sender
            .send(envelope)
            .map_err(|e| InMemoryBusError::Disconnected(e.0.endpoint().clone()))
    }

    fn subscribe(&self, endpoint: &Endpoint) -> Subscription<Envelope> {
        match self.queues.lock() {
            Ok(mut queues) => {
                let queue = queues
                    .entry(endpoint.clone())
                    .or_insert_with(EndpointQueue::new);
                Subscription::new(Arc::clone(&queue.receiver))
            }
            // If the lock is poisoned we still return a subscription; it is simply
            // never fed.
            Err(_) => Subscription::new(Arc::new(Mutex::new(mpsc::channel().1))),
        }
    }
}
