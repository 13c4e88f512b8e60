//! Job service configuration.
//!
//! Options can be built in code (`with_*`), deserialized from JSON, or read from
//! `JOBSERVICE_*` environment variables:
//!
//! | Variable | Option |
//! |----------|--------|
//! | `JOBSERVICE_DEFAULT_CONCURRENT_JOB_LIMIT` | `default_concurrent_job_limit` |
//! | `JOBSERVICE_DEFAULT_RETRY_LIMIT` | `default_retry_policy.retry_limit` |
//! | `JOBSERVICE_DEFAULT_RETRY_DELAY_MS` | `default_retry_policy.base_delay` |
//! | `JOBSERVICE_MAX_ATTEMPT_DURATION_MS` | `default_max_attempt_duration_ms` |
//! | `JOBSERVICE_SAGA_CONSUMER_THREADS` | `saga_consumer_threads` |
//! | `JOBSERVICE_WORKER_THREADS` | `worker_threads` |
//! | `JOBSERVICE_CONFLICT_RETRY_LIMIT` | `conflict_retry_limit` |
//! | `JOBSERVICE_POLL_INTERVAL_MS` | `poll_interval_ms` |
//! | `JOBSERVICE_SCHEDULER_POLL_INTERVAL_MS` | `scheduler_poll_interval_ms` |
//! | `JOBSERVICE_HOST_STATE_MACHINES` | `host_state_machines` |

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use jobservice_core::{JobTypeKey, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("malformed configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Per job type overrides of the service defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTypeOptions {
    pub concurrent_job_limit: Option<u32>,
    pub retry_policy: Option<RetryPolicy>,
    pub max_attempt_duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobServiceOptions {
    /// Cap used when a job type instance is created by its first submission.
    pub default_concurrent_job_limit: u32,
    pub default_retry_policy: RetryPolicy,
    pub default_max_attempt_duration_ms: u64,
    /// Overrides keyed by job type.
    pub job_types: BTreeMap<String, JobTypeOptions>,
    /// Consumer threads per state machine endpoint.
    pub saga_consumer_threads: usize,
    /// Worker threads per registered job type.
    pub worker_threads: usize,
    /// Reload-and-retry rounds after an optimistic concurrency conflict.
    pub conflict_retry_limit: u32,
    pub poll_interval_ms: u64,
    pub scheduler_poll_interval_ms: u64,
    /// Host the job type, job, and attempt endpoints on this node. When false the
    /// node only runs job consumers against a shared transport.
    pub host_state_machines: bool,
}

impl Default for JobServiceOptions {
    fn default() -> Self {
        Self {
            default_concurrent_job_limit: 1,
            default_retry_policy: RetryPolicy::default(),
            default_max_attempt_duration_ms: 5 * 60 * 1000,
            job_types: BTreeMap::new(),
            saga_consumer_threads: 2,
            worker_threads: 2,
            conflict_retry_limit: 5,
            poll_interval_ms: 100,
            scheduler_poll_interval_ms: 50,
            host_state_machines: true,
        }
    }
}

impl JobServiceOptions {
    /// Defaults overlaid with `JOBSERVICE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for the `JOBSERVICE_*` keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut options = Self::default();

        if let Some(v) = parse(&lookup, "JOBSERVICE_DEFAULT_CONCURRENT_JOB_LIMIT")? {
            options.default_concurrent_job_limit = v;
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_DEFAULT_RETRY_LIMIT")? {
            options.default_retry_policy.retry_limit = v;
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_DEFAULT_RETRY_DELAY_MS")? {
            options.default_retry_policy.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_MAX_ATTEMPT_DURATION_MS")? {
            options.default_max_attempt_duration_ms = v;
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_SAGA_CONSUMER_THREADS")? {
            options.saga_consumer_threads = v;
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_WORKER_THREADS")? {
            options.worker_threads = v;
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_CONFLICT_RETRY_LIMIT")? {
            options.conflict_retry_limit = v;
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_POLL_INTERVAL_MS")? {
            options.poll_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_SCHEDULER_POLL_INTERVAL_MS")? {
            options.scheduler_poll_interval_ms = v;
        }
        if let Some(v) = parse(&lookup, "JOBSERVICE_HOST_STATE_MACHINES")? {
            options.host_state_machines = v;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_concurrent_job_limit == 0 {
            return Err(ConfigError::Invalid(
                "default_concurrent_job_limit must be at least 1".to_string(),
            ));
        }
        if self.default_max_attempt_duration_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_max_attempt_duration_ms must be positive".to_string(),
            ));
        }
        if self.saga_consumer_threads == 0 || self.worker_threads == 0 {
            return Err(ConfigError::Invalid(
                "thread counts must be at least 1".to_string(),
            ));
        }
        for (job_type, overrides) in &self.job_types {
            JobTypeKey::new(job_type.as_str())
                .map_err(|e| ConfigError::Invalid(format!("job type {job_type:?}: {e}")))?;
            if overrides.concurrent_job_limit == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "job type {job_type}: concurrent_job_limit must be at least 1"
                )));
            }
            if overrides.max_attempt_duration_ms == Some(0) {
                return Err(ConfigError::Invalid(format!(
                    "job type {job_type}: max_attempt_duration_ms must be positive"
                )));
            }
        }
        Ok(())
    }

    pub fn with_default_concurrent_job_limit(mut self, limit: u32) -> Self {
        self.default_concurrent_job_limit = limit;
        self
    }

    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = policy;
        self
    }

    pub fn with_default_max_attempt_duration(mut self, duration: Duration) -> Self {
        self.default_max_attempt_duration_ms = duration_ms(duration);
        self
    }

    pub fn with_job_type(mut self, job_type: &JobTypeKey, overrides: JobTypeOptions) -> Self {
        self.job_types.insert(job_type.as_str().to_string(), overrides);
        self
    }

    pub fn with_saga_consumer_threads(mut self, threads: usize) -> Self {
        self.saga_consumer_threads = threads;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn with_conflict_retry_limit(mut self, limit: u32) -> Self {
        self.conflict_retry_limit = limit;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_scheduler_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler_poll_interval_ms = duration_ms(interval);
        self
    }

    pub fn with_host_state_machines(mut self, host: bool) -> Self {
        self.host_state_machines = host;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_interval_ms)
    }

    pub fn concurrent_job_limit_for(&self, job_type: &JobTypeKey) -> u32 {
        self.overrides(job_type)
            .and_then(|o| o.concurrent_job_limit)
            .unwrap_or(self.default_concurrent_job_limit)
    }

    pub fn retry_policy_for(&self, job_type: &JobTypeKey) -> RetryPolicy {
        self.overrides(job_type)
            .and_then(|o| o.retry_policy.clone())
            .unwrap_or_else(|| self.default_retry_policy.clone())
    }

    pub fn max_attempt_duration_for(&self, job_type: &JobTypeKey) -> Duration {
        let ms = self
            .overrides(job_type)
            .and_then(|o| o.max_attempt_duration_ms)
            .unwrap_or(self.default_max_attempt_duration_ms);
        Duration::from_millis(ms)
    }

    fn overrides(&self, job_type: &JobTypeKey) -> Option<&JobTypeOptions> {
        self.job_types.get(job_type.as_str())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
