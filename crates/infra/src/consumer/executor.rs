//! Job consumer: executes attempts with registered handlers and reports outcomes.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use jobservice_core::JobTypeKey;
use jobservice_events::{
    AttemptCompleted, AttemptFaulted, Endpoint, Envelope, ExecuteAttempt, JobMessage, MessageBus,
    Subscription,
};

use super::types::{JobContext, JobHandler, JobOutcome};

/// Job consumer configuration.
#[derive(Debug, Clone)]
pub struct JobConsumerConfig {
    /// Threads per registered job type, all competing for the same queue.
    pub worker_threads: usize,
    /// How long a worker blocks on its queue before checking for shutdown.
    pub poll_interval: Duration,
    /// Name prefix for threads and logs.
    pub name: String,
}

impl Default for JobConsumerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 2,
            poll_interval: Duration::from_millis(100),
            name: "job-consumer".to_string(),
        }
    }
}

impl JobConsumerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Consumer runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConsumerStats {
    pub attempts_executed: u64,
    pub attempts_completed: u64,
    pub attempts_faulted: u64,
    /// Work items received after their deadline and not executed.
    pub attempts_skipped: u64,
    pub handler_panics: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Registry of job handlers, one per job type.
pub struct JobConsumer {
    handlers: HashMap<JobTypeKey, JobHandler>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl Default for JobConsumer {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for JobConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobConsumer")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl JobConsumer {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            stats: Arc::new(Mutex::new(ConsumerStats::default())),
        }
    }

    /// Register the handler for a job type (replaces an earlier one).
    pub fn register_handler<F>(&mut self, job_type: JobTypeKey, handler: F)
    where
        F: Fn(&JobContext) -> JobOutcome + Send + Sync + 'static,
    {
        self.handlers.insert(job_type, Box::new(handler));
    }

    pub fn job_types(&self) -> impl Iterator<Item = &JobTypeKey> {
        self.handlers.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Execute one work item and build the report for its attempt.
    ///
    /// Returns `None` when the item was already past its deadline: the attempt's
    /// timeout reports the fault, so executing it would only waste the slot.
    pub fn execute_one(&self, work: &ExecuteAttempt, now: DateTime<Utc>) -> Option<JobMessage> {
        if now > work.deadline {
            warn!(
                job_id = %work.job_id,
                attempt_id = %work.attempt_id,
                deadline = %work.deadline,
                "work item past its deadline, skipping"
            );
            self.update_stats(|s| s.attempts_skipped += 1);
            return None;
        }

        let outcome = match self.handlers.get(&work.job_type) {
            Some(handler) => {
                let ctx = JobContext::from(work);
                self.update_stats(|s| s.current_running += 1);
                let result = catch_unwind(AssertUnwindSafe(|| handler(&ctx)));
                self.update_stats(|s| s.current_running = s.current_running.saturating_sub(1));

                result.unwrap_or_else(|panic| {
                    let reason = panic_message(panic.as_ref());
                    error!(job_id = %work.job_id, attempt_id = %work.attempt_id, reason = %reason, "job handler panicked");
                    self.update_stats(|s| s.handler_panics += 1);
                    JobOutcome::Faulted(format!("handler panicked: {reason}"))
                })
            }
            None => {
                warn!(job_type = %work.job_type, "no handler for job type");
                JobOutcome::Faulted(format!("no handler registered for job type {}", work.job_type))
            }
        };

        self.update_stats(|s| {
            s.attempts_executed += 1;
            match &outcome {
                JobOutcome::Completed(_) => s.attempts_completed += 1,
                JobOutcome::Faulted(_) => s.attempts_faulted += 1,
            }
        });

        Some(match outcome {
            JobOutcome::Completed(result) => {
                debug!(job_id = %work.job_id, attempt_id = %work.attempt_id, "attempt completed");
                JobMessage::AttemptCompleted(AttemptCompleted {
                    job_id: work.job_id,
                    attempt_id: work.attempt_id,
                    result,
                })
            }
            JobOutcome::Faulted(reason) => {
                debug!(job_id = %work.job_id, attempt_id = %work.attempt_id, reason = %reason, "attempt faulted");
                JobMessage::AttemptFaulted(AttemptFaulted {
                    job_id: work.job_id,
                    attempt_id: work.attempt_id,
                    reason,
                    timed_out: false,
                })
            }
        })
    }

    /// Spawn `worker_threads` workers for every registered job type.
    pub fn spawn<B>(self, bus: B, config: JobConsumerConfig) -> JobConsumerHandle
    where
        B: MessageBus + Clone + 'static,
    {
        let stats = Arc::clone(&self.stats);
        let job_types: Vec<JobTypeKey> = self.handlers.keys().cloned().collect();
        let consumer = Arc::new(self);
        let started = Instant::now();
        let mut workers = Vec::new();

        for job_type in job_types {
            let subscription = bus.subscribe(&Endpoint::JobConsumer(job_type.clone()));

            for index in 0..config.worker_threads.max(1) {
                let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
                let name = format!("{}-{}-{}", config.name, job_type, index);
                let consumer = Arc::clone(&consumer);
                let bus = bus.clone();
                let subscription = subscription.clone();
                let poll_interval = config.poll_interval;
                let thread_name = name.clone();

                let join = thread::Builder::new()
                    .name(name)
                    .spawn(move || {
                        worker_loop(&thread_name, &consumer, &bus, subscription, shutdown_rx, poll_interval, started)
                    })
                    .expect("failed to spawn job consumer thread");

                workers.push((shutdown_tx, join));
            }
        }

        JobConsumerHandle { workers, stats }
    }

    fn update_stats(&self, f: impl FnOnce(&mut ConsumerStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }
}

/// Handle to control running consumer workers.
#[derive(Debug)]
pub struct JobConsumerHandle {
    workers: Vec<(mpsc::Sender<()>, thread::JoinHandle<()>)>,
    stats: Arc<Mutex<ConsumerStats>>,
}

impl JobConsumerHandle {
    /// Request graceful shutdown and wait for every worker to stop.
    ///
    /// A worker finishes the attempt it is executing before it stops.
    pub fn shutdown(self) {
        for (shutdown, _) in &self.workers {
            let _ = shutdown.send(());
        }
        for (_, join) in self.workers {
            let _ = join.join();
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> ConsumerStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

fn worker_loop<B: MessageBus>(
    name: &str,
    consumer: &JobConsumer,
    bus: &B,
    subscription: Subscription<Envelope>,
    shutdown_rx: mpsc::Receiver<()>,
    poll_interval: Duration,
    started: Instant,
) {
    info!(worker = name, "job consumer started");

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        match subscription.recv_timeout(poll_interval) {
            Ok(envelope) => {
                let JobMessage::ExecuteAttempt(work) = envelope.message() else {
                    warn!(
                        worker = name,
                        message_type = envelope.message().message_type(),
                        "unexpected message on job consumer queue"
                    );
                    continue;
                };

                let Some(report) = consumer.execute_one(work, Utc::now()) else {
                    continue;
                };

                if let Err(err) = bus.send(Envelope::new(Endpoint::JobAttempt, report, Utc::now())) {
                    error!(worker = name, attempt_id = %work.attempt_id, error = %err, "failed to report attempt outcome");
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        consumer.update_stats(|s| s.uptime_secs = started.elapsed().as_secs());
    }

    info!(worker = name, "job consumer stopped");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
