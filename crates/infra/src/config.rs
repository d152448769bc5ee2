//! Configuration loading and representation.
//!
//! Everything is read from `JOBFLOW_*` environment variables with typed defaults.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `JOBFLOW_CONCURRENCY` | `10` | In-flight messages per consumer instance |
//! | `JOBFLOW_MAX_ATTEMPTS` | `5` | Delivery attempts before `MAX_RETRIES_EXCEEDED` |
//! | `JOBFLOW_PROCESSING_TIMEOUT_MS` | `30000` | Default per-job processing timeout |
//! | `JOBFLOW_BACKOFF_BASE_MS` | `2000` | First redelivery delay |
//! | `JOBFLOW_BACKOFF_FACTOR` | `2` | Multiplier per attempt |
//! | `JOBFLOW_BACKOFF_CAP_MS` | `60000` | Redelivery delay ceiling |
//! | `JOBFLOW_BACKOFF_JITTER` | `0.2` | Relative jitter (±) |
//! | `JOBFLOW_SHUTDOWN_GRACE_MS` | `10000` | Drain window on shutdown |
//! | `JOBFLOW_PUBLISH_RETRIES` | `3` | Event publish retries after the first try |
//! | `JOBFLOW_PUBLISH_BACKOFF_MS` | `250` | Fixed delay between publish retries |
//! | `JOBFLOW_JOB_TOPIC` | `jobflow:jobs` | Job topic |
//! | `JOBFLOW_EVENT_TOPIC` | `jobflow:events` | Completion event topic |
//! | `JOBFLOW_WORKER_GROUP` | `jobflow.workers` | Worker subscription |
//! | `JOBFLOW_DISPATCHER_GROUP` | `jobflow.dispatcher` | Dispatcher subscription |
//! | `JOBFLOW_CONSUMER_NAME` | `consumer-<uuid v7>` | Consumer name inside the group |
//!
//! Unparsable values are logged and replaced by the default.

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::retry::RetryPolicy;

const PREFIX: &str = "JOBFLOW_";

/// Settings shared by the worker and the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Maximum concurrently processed messages per instance.
    pub concurrency: usize,
    /// Processing timeout for job types without their own.
    pub processing_timeout: Duration,
    /// How long in-flight handlers may run after shutdown is requested.
    pub shutdown_grace: Duration,
    /// Redelivery policy for retryable job failures.
    pub retry: RetryPolicy,
    /// Event publisher retry budget.
    pub publish: PublishPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            processing_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            publish: PublishPolicy::default(),
        }
    }
}

/// Fixed-backoff retry budget for publishing completion events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishPolicy {
    /// Retries after the first attempt.
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff: Duration::from_millis(250),
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` for variable values (keys include the `JOBFLOW_` prefix).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = EnvReader::new(&lookup);
        let defaults = Self::default();
        let retry_defaults = RetryPolicy::default();

        Self {
            concurrency: env.parse("CONCURRENCY", defaults.concurrency).max(1),
            processing_timeout: env.millis("PROCESSING_TIMEOUT_MS", defaults.processing_timeout),
            shutdown_grace: env.millis("SHUTDOWN_GRACE_MS", defaults.shutdown_grace),
            retry: RetryPolicy {
                max_attempts: env.parse("MAX_ATTEMPTS", retry_defaults.max_attempts).max(1),
                base_delay: env.millis("BACKOFF_BASE_MS", retry_defaults.base_delay),
                factor: env.parse("BACKOFF_FACTOR", retry_defaults.factor).max(1.0),
                max_delay: env.millis("BACKOFF_CAP_MS", retry_defaults.max_delay),
                jitter: env.parse("BACKOFF_JITTER", retry_defaults.jitter).clamp(0.0, 1.0),
            },
            publish: PublishPolicy {
                retries: env.parse("PUBLISH_RETRIES", defaults.publish.retries),
                backoff: env.millis("PUBLISH_BACKOFF_MS", defaults.publish.backoff),
            },
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.retry.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_processing_timeout(mut self, timeout: Duration) -> Self {
        self.processing_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_publish_policy(mut self, publish: PublishPolicy) -> Self {
        self.publish = publish;
        self
    }
}

/// Topic and subscription names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyConfig {
    pub job_topic: String,
    pub event_topic: String,
    pub worker_group: String,
    pub dispatcher_group: String,
    pub consumer_name: String,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            job_topic: "jobflow:jobs".to_string(),
            event_topic: "jobflow:events".to_string(),
            worker_group: "jobflow.workers".to_string(),
            dispatcher_group: "jobflow.dispatcher".to_string(),
            consumer_name: format!("consumer-{}", uuid::Uuid::now_v7()),
        }
    }
}

impl TopologyConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = EnvReader::new(&lookup);
        let defaults = Self::default();

        Self {
            job_topic: env.string("JOB_TOPIC", defaults.job_topic),
            event_topic: env.string("EVENT_TOPIC", defaults.event_topic),
            worker_group: env.string("WORKER_GROUP", defaults.worker_group),
            dispatcher_group: env.string("DISPATCHER_GROUP", defaults.dispatcher_group),
            consumer_name: env.string("CONSUMER_NAME", defaults.consumer_name),
        }
    }
}

/// Reads `JOBFLOW_*` variables through a lookup function.
pub struct EnvReader<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<'a, F: Fn(&str) -> Option<String>> EnvReader<'a, F> {
    pub fn new(lookup: &'a F) -> Self {
        Self { lookup }
    }

    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{name}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn string(&self, name: &str, default: String) -> String {
        self.raw(name).unwrap_or(default)
    }

    pub fn optional(&self, name: &str) -> Option<String> {
        self.raw(name)
    }

    pub fn parse<T>(&self, name: &str, default: T) -> T
    where
        T: FromStr + core::fmt::Debug,
    {
        match self.raw(name) {
            None => default,
            Some(value) => value.parse().unwrap_or_else(|_| {
                warn!(variable = %format!("{PREFIX}{name}"), %value, ?default, "invalid value, using default");
                default
            }),
        }
    }

    pub fn millis(&self, name: &str, default: Duration) -> Duration {
        let ms = self.parse(name, default.as_millis() as u64);
        Duration::from_millis(ms)
    }
}
