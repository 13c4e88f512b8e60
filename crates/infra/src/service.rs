//! Job service hosting: wires repositories, transport, dispatcher, and workers into
//! running threads, and exposes a client for submitting and inspecting jobs.
//!
//! A node started with `host_state_machines = false` only runs job consumers; it
//! cooperates with nodes hosting the state machines through the shared transport.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info, warn};

use jobservice_core::{AttemptId, DomainError, JobId, JobTypeKey};
use jobservice_events::{
    CancelRequested, Endpoint, Envelope, InMemoryMessageBus, InMemoryMessageScheduler, JobMessage,
    MessageBus, MessageScheduler, ScheduleId, SetConcurrentJobLimit, SubmitJob, Subscription,
};
use jobservice_jobs::{Job, JobAttempt, JobType};

use crate::config::{ConfigError, JobServiceOptions};
use crate::consumer::{
    ConsumerStats, JobConsumer, JobConsumerConfig, JobConsumerHandle, JobContext, JobOutcome,
};
use crate::dispatcher::{DispatchError, Dispatcher};
use crate::saga::SagaRepositories;
use crate::saga_repository::{SagaRepository, SagaRepositoryError};
use crate::workers::{EndpointWorker, SchedulerPump, WorkerHandle};

/// Delay before a message whose dispatch failed transiently is delivered again.
const REDELIVERY_DELAY_SECS: i64 = 1;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to send: {0}")]
    Bus(String),

    #[error(transparent)]
    Repository(#[from] SagaRepositoryError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

type ServiceDispatcher = Dispatcher<Arc<InMemoryMessageBus>, Arc<InMemoryMessageScheduler>>;

/// Builder for a job service node.
pub struct JobService {
    options: JobServiceOptions,
    repositories: SagaRepositories,
    bus: Arc<InMemoryMessageBus>,
    scheduler: Arc<InMemoryMessageScheduler>,
    consumer: JobConsumer,
}

impl JobService {
    pub fn new(options: JobServiceOptions) -> Self {
        Self {
            options,
            repositories: SagaRepositories::in_memory(),
            bus: InMemoryMessageBus::arc(),
            scheduler: InMemoryMessageScheduler::arc(),
            consumer: JobConsumer::new(),
        }
    }

    /// Use shared saga repositories instead of private in-memory ones.
    pub fn with_repositories(mut self, repositories: SagaRepositories) -> Self {
        self.repositories = repositories;
        self
    }

    /// Use a transport shared with other nodes.
    pub fn with_transport(
        mut self,
        bus: Arc<InMemoryMessageBus>,
        scheduler: Arc<InMemoryMessageScheduler>,
    ) -> Self {
        self.bus = bus;
        self.scheduler = scheduler;
        self
    }

    pub fn register_handler<F>(mut self, job_type: JobTypeKey, handler: F) -> Self
    where
        F: Fn(&JobContext) -> JobOutcome + Send + Sync + 'static,
    {
        self.consumer.register_handler(job_type, handler);
        self
    }

    pub fn options(&self) -> &JobServiceOptions {
        &self.options
    }

    pub fn client(&self) -> JobClient {
        JobClient {
            options: Arc::new(self.options.clone()),
            repositories: self.repositories.clone(),
            bus: Arc::clone(&self.bus),
        }
    }

    /// Spawn the node's threads.
    pub fn start(self) -> Result<JobServiceHandle, ConfigError> {
        self.options.validate()?;

        let client = self.client();
        let poll_interval = self.options.poll_interval();
        let mut workers = Vec::new();

        if self.options.host_state_machines {
            let dispatcher: Arc<ServiceDispatcher> = Arc::new(Dispatcher::new(
                &self.repositories,
                Arc::clone(&self.bus),
                Arc::clone(&self.scheduler),
                self.options.conflict_retry_limit,
            ));

            for endpoint in [Endpoint::JobType, Endpoint::Job, Endpoint::JobAttempt] {
                let subscription = self.bus.subscribe(&endpoint);
                for index in 0..self.options.saga_consumer_threads {
                    let dispatcher = Arc::clone(&dispatcher);
                    let scheduler = Arc::clone(&self.scheduler);
                    workers.push(EndpointWorker::spawn(
                        format!("saga-{endpoint}-{index}"),
                        subscription.clone(),
                        poll_interval,
                        move |envelope: Envelope| handle_saga_message(&dispatcher, &scheduler, envelope),
                    ));
                }
            }
        }

        workers.push(SchedulerPump::spawn(
            Arc::clone(&self.scheduler),
            Arc::clone(&self.bus),
            self.options.scheduler_poll_interval(),
        ));

        let job_types: Vec<String> = self.consumer.job_types().map(|k| k.to_string()).collect();
        let consumers = if self.consumer.is_empty() {
            None
        } else {
            let config = JobConsumerConfig::default()
                .with_worker_threads(self.options.worker_threads)
                .with_poll_interval(poll_interval);
            Some(self.consumer.spawn(Arc::clone(&self.bus), config))
        };

        info!(
            host_state_machines = self.options.host_state_machines,
            saga_consumer_threads = self.options.saga_consumer_threads,
            job_types = ?job_types,
            "job service started"
        );

        Ok(JobServiceHandle {
            client,
            workers,
            consumers,
        })
    }
}

fn handle_saga_message(
    dispatcher: &ServiceDispatcher,
    scheduler: &InMemoryMessageScheduler,
    envelope: Envelope,
) -> Result<(), DispatchError> {
    let now = Utc::now();
    match dispatcher.dispatch(&envelope, now) {
        Ok(_) => Ok(()),
        Err(err) if err.is_transient() => {
            warn!(
                message_id = %envelope.message_id(),
                message_type = envelope.message().message_type(),
                error = %err,
                "dispatch failed, scheduling redelivery"
            );
            let schedule_id = ScheduleId::new(format!("redelivery:{}", envelope.message_id()));
            scheduler
                .schedule(schedule_id, now + TimeDelta::seconds(REDELIVERY_DELAY_SECS), envelope)
                .map_err(|e| DispatchError::Publish(e.to_string()))
        }
        Err(err) => Err(err),
    }
}

/// Running job service node.
#[derive(Debug)]
pub struct JobServiceHandle {
    client: JobClient,
    workers: Vec<WorkerHandle>,
    consumers: Option<JobConsumerHandle>,
}

impl JobServiceHandle {
    pub fn client(&self) -> &JobClient {
        &self.client
    }

    pub fn consumer_stats(&self) -> ConsumerStats {
        self.consumers
            .as_ref()
            .map(JobConsumerHandle::stats)
            .unwrap_or_default()
    }

    /// Stop job consumers first (letting running handlers finish), then the state
    /// machine consumers and the scheduler pump.
    pub fn shutdown(self) {
        if let Some(consumers) = self.consumers {
            consumers.shutdown();
        }
        for worker in self.workers {
            worker.shutdown();
        }
        info!("job service stopped");
    }
}

/// Submits, cancels, and inspects jobs.
#[derive(Clone)]
pub struct JobClient {
    options: Arc<JobServiceOptions>,
    repositories: SagaRepositories,
    bus: Arc<InMemoryMessageBus>,
}

impl core::fmt::Debug for JobClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobClient").finish_non_exhaustive()
    }
}

impl JobClient {
    /// Submit a job with the configured policy for its type.
    pub fn submit(&self, job_type: &JobTypeKey, payload: JsonValue) -> Result<JobId, ClientError> {
        self.submit_with_id(JobId::new(), job_type, payload)
    }

    /// Submit under a caller-chosen id. Submitting the same id twice creates one job.
    pub fn submit_with_id(
        &self,
        job_id: JobId,
        job_type: &JobTypeKey,
        payload: JsonValue,
    ) -> Result<JobId, ClientError> {
        self.submit_job(SubmitJob {
            job_id,
            job_type: job_type.clone(),
            payload,
            retry_policy: self.options.retry_policy_for(job_type),
            max_attempt_duration: self.options.max_attempt_duration_for(job_type),
            concurrent_job_limit: self.options.concurrent_job_limit_for(job_type),
        })
    }

    pub fn submit_job(&self, submit: SubmitJob) -> Result<JobId, ClientError> {
        if submit.max_attempt_duration.is_zero() {
            return Err(DomainError::validation("max attempt duration must be positive").into());
        }
        if submit.concurrent_job_limit == 0 {
            return Err(DomainError::validation("concurrent job limit must be at least 1").into());
        }

        let job_id = submit.job_id;
        info!(job_id = %job_id, job_type = %submit.job_type, "submitting job");
        self.send(Endpoint::Job, JobMessage::SubmitJob(submit))?;
        Ok(job_id)
    }

    pub fn cancel(&self, job_id: JobId, reason: Option<String>) -> Result<(), ClientError> {
        self.send(
            Endpoint::Job,
            JobMessage::CancelRequested(CancelRequested { job_id, reason }),
        )
    }

    pub fn set_concurrent_job_limit(
        &self,
        job_type: &JobTypeKey,
        concurrent_job_limit: u32,
    ) -> Result<(), ClientError> {
        if concurrent_job_limit == 0 {
            return Err(DomainError::validation("concurrent job limit must be at least 1").into());
        }
        self.send(
            Endpoint::JobType,
            JobMessage::SetConcurrentJobLimit(SetConcurrentJobLimit {
                job_type: job_type.clone(),
                concurrent_job_limit,
            }),
        )
    }

    pub fn job(&self, job_id: JobId) -> Result<Option<Job>, ClientError> {
        Ok(self.repositories.jobs.load(&job_id)?.map(|r| r.instance))
    }

    pub fn job_type(&self, job_type: &JobTypeKey) -> Result<Option<JobType>, ClientError> {
        Ok(self.repositories.job_types.load(job_type)?.map(|r| r.instance))
    }

    pub fn attempt(&self, attempt_id: AttemptId) -> Result<Option<JobAttempt>, ClientError> {
        Ok(self.repositories.attempts.load(&attempt_id)?.map(|r| r.instance))
    }

    /// Attempts of a job, oldest first.
    pub fn attempts(&self, job_id: JobId) -> Result<Vec<JobAttempt>, ClientError> {
        let Some(job) = self.job(job_id)? else {
            return Ok(Vec::new());
        };
        let mut attempts = Vec::with_capacity(job.attempt_ids().len());
        for attempt_id in job.attempt_ids() {
            if let Some(attempt) = self.attempt(*attempt_id)? {
                attempts.push(attempt);
            }
        }
        Ok(attempts)
    }

    /// Poll the job until it is terminal or `timeout` elapses; returns its last state.
    pub fn wait_for_terminal(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<Option<Job>, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            let job = self.job(job_id)?;
            let finished = job.as_ref().is_some_and(|j| j.status().is_terminal());
            if finished || Instant::now() >= deadline {
                return Ok(job);
            }
            thread::sleep(self.options.poll_interval().min(Duration::from_millis(10)));
        }
    }

    /// Terminal notifications (`JobCompleted`, `JobFaulted`, `JobCanceled`).
    ///
    /// Subscribers compete: each notification is received by one of them.
    pub fn notifications(&self) -> Subscription<Envelope> {
        self.bus.subscribe(&Endpoint::Notifications)
    }

    fn send(&self, endpoint: Endpoint, message: JobMessage) -> Result<(), ClientError> {
        self.bus
            .send(Envelope::new(endpoint, message, Utc::now()))
            .map_err(|e| ClientError::Bus(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use jobservice_core::RetryPolicy;
    use serde_json::json;

    use super::*;

    #[test]
    fn client_rejects_invalid_requests_before_sending() {
        let service = JobService::new(JobServiceOptions::default());
        let client = service.client();
        let key = JobTypeKey::new("export").unwrap();

        assert!(matches!(
            client.set_concurrent_job_limit(&key, 0),
            Err(ClientError::Domain(DomainError::Validation(_)))
        ));

        let err = client
            .submit_job(SubmitJob {
                job_id: JobId::new(),
                job_type: key.clone(),
                payload: json!({}),
                retry_policy: RetryPolicy::none(),
                max_attempt_duration: Duration::ZERO,
                concurrent_job_limit: 1,
            })
            .unwrap_err();
        assert!(matches!(err, ClientError::Domain(DomainError::Validation(_))));
    }

    #[test]
    fn unknown_ids_read_as_none() {
        let client = JobService::new(JobServiceOptions::default()).client();

        assert!(client.job(JobId::new()).unwrap().is_none());
        assert!(client.attempts(JobId::new()).unwrap().is_empty());
        assert!(
            client
                .job_type(&JobTypeKey::new("export").unwrap())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn invalid_options_fail_start() {
        let service = JobService::new(JobServiceOptions::default().with_worker_threads(0));
        assert!(matches!(service.start(), Err(ConfigError::Invalid(_))));
    }
}
