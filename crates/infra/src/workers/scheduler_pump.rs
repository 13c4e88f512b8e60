//! Moves due scheduled messages from the in-memory scheduler onto the bus.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, warn};

use jobservice_events::{InMemoryMessageScheduler, MessageBus};

use super::endpoint_worker::WorkerHandle;

#[derive(Debug)]
pub struct SchedulerPump;

impl SchedulerPump {
    /// Spawn the pump thread.
    ///
    /// Every `poll_interval` the messages due at the current time are released and
    /// sent in due order. Delivery is therefore late by at most one interval.
    pub fn spawn<B>(
        scheduler: Arc<InMemoryMessageScheduler>,
        bus: B,
        poll_interval: Duration,
    ) -> WorkerHandle
    where
        B: MessageBus + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = "scheduler-pump".to_string();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || pump_loop(&scheduler, &bus, shutdown_rx, poll_interval))
            .expect("failed to spawn scheduler pump thread");

        WorkerHandle::new(name, shutdown_tx, join)
    }
}

fn pump_loop<B: MessageBus>(
    scheduler: &InMemoryMessageScheduler,
    bus: &B,
    shutdown_rx: mpsc::Receiver<()>,
    poll_interval: Duration,
) {
    loop {
        match shutdown_rx.recv_timeout(poll_interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }

        let due = match scheduler.release_due(Utc::now()) {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "scheduler unavailable, stopping pump");
                break;
            }
        };

        for envelope in due {
            debug!(
                endpoint = %envelope.endpoint(),
                message_type = envelope.message().message_type(),
                "delivering scheduled message"
            );
            if let Err(err) = bus.send(envelope) {
                warn!(error = %err, "failed to deliver scheduled message");
            }
        }
    }
}
