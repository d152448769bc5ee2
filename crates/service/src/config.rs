//! Service configuration.
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `JOBFLOW_ROLE` | `worker` | `worker` or `dispatcher` |
//! | `JOBFLOW_REDIS_URL` | `redis://127.0.0.1:6379` | Broker connection |
//! | `JOBFLOW_CLIENT_MAP_KEY` | `jobflow:job-clients` | Hash mapping job ids to client ids |
//! | `JOBFLOW_WEBHOOK_URL` | unset | Relay URL for client notifications |
//! | `JOBFLOW_WEBHOOK_SECRET` | unset | HMAC secret for relay requests |
//!
//! Pipeline and topology settings are documented on
//! [`PipelineConfig`](jobflow_infra::PipelineConfig).

use core::str::FromStr;

use thiserror::Error;
use tracing::warn;

use jobflow_infra::config::EnvReader;
use jobflow_infra::{PipelineConfig, TopologyConfig, WebhookConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Worker,
    Dispatcher,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role '{0}' (expected 'worker' or 'dispatcher')")]
pub struct UnknownRole(String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "worker" => Ok(Role::Worker),
            "dispatcher" => Ok(Role::Dispatcher),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub role: Role,
    pub redis_url: String,
    pub client_map_key: String,
    pub webhook: Option<WebhookConfig>,
    pub pipeline: PipelineConfig,
    pub topology: TopologyConfig,
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let env = EnvReader::new(&lookup);

        let role = match env.optional("ROLE") {
            None => Role::default(),
            Some(raw) => raw.parse().unwrap_or_else(|err: UnknownRole| {
                warn!(error = %err, "invalid JOBFLOW_ROLE, running as worker");
                Role::Worker
            }),
        };

        let webhook = env.optional("WEBHOOK_URL").map(|url| {
            let config = WebhookConfig::new(url);
            match env.optional("WEBHOOK_SECRET") {
                Some(secret) => config.with_secret(secret),
                None => config,
            }
        });

        Self {
            role,
            redis_url: env.string("REDIS_URL", "redis://127.0.0.1:6379".to_string()),
            client_map_key: env.string("CLIENT_MAP_KEY", "jobflow:job-clients".to_string()),
            webhook,
            pipeline: PipelineConfig::from_lookup(&lookup),
            topology: TopologyConfig::from_lookup(&lookup),
        }
    }
}
