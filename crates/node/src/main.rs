//! Runs a job service node with a demo consumer.
//!
//! Configuration comes from `JOBSERVICE_*` variables (see `JobServiceOptions`), plus:
//!
//! - `JOBSERVICE_LOG_FORMAT`: `json` (default) or `pretty`
//! - `JOBSERVICE_DEMO_JOBS`: number of `demo.sleep` jobs to submit (default 5)
//! - `DATABASE_URL`: with the `postgres` feature, keep saga instances in Postgres

use std::collections::HashSet;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::json;

use jobservice_core::JobTypeKey;
use jobservice_events::{Envelope, JobMessage};
use jobservice_infra::{JobOutcome, JobService, JobServiceOptions, SagaRepositories};
use jobservice_observability::LogFormat;

const DEMO_JOB_TYPE: &str = "demo.sleep";
const DEMO_TIMEOUT: Duration = Duration::from_secs(120);

fn main() -> anyhow::Result<()> {
    let log_format = match std::env::var("JOBSERVICE_LOG_FORMAT") {
        Ok(raw) => raw.parse::<LogFormat>().map_err(anyhow::Error::msg)?,
        Err(_) => LogFormat::default(),
    };
    jobservice_observability::init_with(log_format);

    let options = JobServiceOptions::from_env().context("invalid JOBSERVICE_* configuration")?;
    let demo_jobs: usize = std::env::var("JOBSERVICE_DEMO_JOBS")
        .ok()
        .map(|raw| raw.parse::<usize>())
        .transpose()
        .context("JOBSERVICE_DEMO_JOBS must be a number")?
        .unwrap_or(5);

    let backend = storage::connect()?;
    let job_type = JobTypeKey::new(DEMO_JOB_TYPE)?;

    let handle = JobService::new(options)
        .with_repositories(backend.repositories())
        .register_handler(job_type.clone(), |ctx| {
            let sleep_ms = ctx.payload["sleep_ms"].as_u64().unwrap_or(100);
            thread::sleep(Duration::from_millis(sleep_ms));

            if ctx.payload["fail_first"].as_bool().unwrap_or(false) && !ctx.is_retry() {
                return JobOutcome::faulted("first attempt fails on request");
            }
            JobOutcome::Completed(json!({ "slept_ms": sleep_ms, "retry": ctx.retry_number }))
        })
        .start()?;

    let client = handle.client().clone();
    let notifications = client.notifications();

    let mut pending = HashSet::new();
    for n in 0..demo_jobs {
        let payload = json!({ "sleep_ms": 50 + 25 * n as u64, "fail_first": n % 3 == 0 });
        pending.insert(client.submit(&job_type, payload)?);
    }
    tracing::info!(jobs = demo_jobs, job_type = DEMO_JOB_TYPE, "demo jobs submitted");

    let deadline = Instant::now() + DEMO_TIMEOUT;
    while !pending.is_empty() && Instant::now() < deadline {
        let Ok(envelope) = notifications.recv_timeout(Duration::from_millis(500)) else {
            continue;
        };
        if let Some(job_id) = report(&envelope) {
            pending.remove(&job_id);
        }
    }

    if !pending.is_empty() {
        tracing::warn!(unfinished = pending.len(), "demo timed out");
    }

    let stats = handle.consumer_stats();
    tracing::info!(
        executed = stats.attempts_executed,
        completed = stats.attempts_completed,
        faulted = stats.attempts_faulted,
        "shutting down"
    );
    handle.shutdown();
    Ok(())
}

fn report(envelope: &Envelope) -> Option<jobservice_core::JobId> {
    match envelope.message() {
        JobMessage::JobCompleted(m) => {
            tracing::info!(job_id = %m.job_id, result = %m.result, "job completed");
            Some(m.job_id)
        }
        JobMessage::JobFaulted(m) => {
            tracing::warn!(job_id = %m.job_id, attempts = m.attempts, reason = %m.reason, "job faulted");
            Some(m.job_id)
        }
        JobMessage::JobCanceled(m) => {
            tracing::info!(job_id = %m.job_id, "job canceled");
            Some(m.job_id)
        }
        _ => None,
    }
}

#[cfg(not(feature = "postgres"))]
mod storage {
    use super::*;

    pub struct Backend;

    impl Backend {
        pub fn repositories(&self) -> SagaRepositories {
            SagaRepositories::in_memory()
        }
    }

    pub fn connect() -> anyhow::Result<Backend> {
        Ok(Backend)
    }
}

#[cfg(feature = "postgres")]
mod storage {
    use std::sync::Arc;

    use sqlx::postgres::PgPoolOptions;
    use tokio::runtime::Runtime;

    use jobservice_infra::saga_repository::PostgresSagaRepository;
    use jobservice_jobs::{Job, JobAttempt, JobType};

    use super::*;

    /// Keeps the runtime alive for the repositories blocking on it.
    pub struct Backend {
        _runtime: Option<Runtime>,
        repositories: SagaRepositories,
    }

    impl Backend {
        pub fn repositories(&self) -> SagaRepositories {
            self.repositories.clone()
        }
    }

    pub fn connect() -> anyhow::Result<Backend> {
        let Ok(url) = std::env::var("DATABASE_URL") else {
            tracing::info!("DATABASE_URL not set; using in-memory saga repositories");
            return Ok(Backend {
                _runtime: None,
                repositories: SagaRepositories::in_memory(),
            });
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to build tokio runtime")?;
        let pool = runtime
            .block_on(PgPoolOptions::new().max_connections(10).connect(&url))
            .context("failed to connect to Postgres")?;

        let job_types = PostgresSagaRepository::<JobType>::new(pool.clone(), runtime.handle().clone());
        runtime.block_on(job_types.migrate())?;

        let repositories = SagaRepositories::new(
            Arc::new(job_types),
            Arc::new(PostgresSagaRepository::<Job>::new(pool.clone(), runtime.handle().clone())),
            Arc::new(PostgresSagaRepository::<JobAttempt>::new(pool, runtime.handle().clone())),
        );
        tracing::info!("saga repositories backed by Postgres");

        Ok(Backend {
            _runtime: Some(runtime),
            repositories,
        })
    }
}
