use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use jobservice_events::{Envelope, Subscription};

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub(crate) fn new(name: String, shutdown: mpsc::Sender<()>, join: thread::JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown,
            join: Some(join),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Consumer loop for one endpoint subscription.
///
/// Several workers on the same endpoint compete for its messages. The handler must be
/// idempotent: delivery is at least once.
#[derive(Debug)]
pub struct EndpointWorker;

impl EndpointWorker {
    pub fn spawn<H, E>(
        name: impl Into<String>,
        subscription: Subscription<Envelope>,
        poll_interval: Duration,
        mut handler: H,
    ) -> WorkerHandle
    where
        H: FnMut(Envelope) -> Result<(), E> + Send + 'static,
        E: core::fmt::Display + Send + 'static,
    {
        let name = name.into();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let thread_name = name.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker_loop(&thread_name, subscription, shutdown_rx, poll_interval, &mut handler))
            .expect("failed to spawn endpoint worker thread");

        WorkerHandle::new(name, shutdown_tx, join)
    }
}

fn worker_loop<H, E>(
    name: &str,
    subscription: Subscription<Envelope>,
    shutdown_rx: mpsc::Receiver<()>,
    poll_interval: Duration,
    handler: &mut H,
) where
    H: FnMut(Envelope) -> Result<(), E>,
    E: core::fmt::Display,
{
    debug!(worker = name, "endpoint worker started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match subscription.recv_timeout(poll_interval) {
            Ok(envelope) => {
                let message_type = envelope.message().message_type();
                if let Err(err) = handler(envelope) {
                    warn!(worker = name, message_type, error = %err, "endpoint worker handler failed");
                }
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(worker = name, "endpoint worker stopped");
}
