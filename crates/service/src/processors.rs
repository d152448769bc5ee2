//! Processors registered by the stock service binary.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use jobflow_events::{JobContext, Processor, ProcessorRegistry};

pub const ECHO_JOB_TYPE: &str = "system.echo";

/// Returns its payload unchanged. Used to smoke-test a deployment end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoProcessor;

#[async_trait]
impl Processor for EchoProcessor {
    async fn process(&self, ctx: &JobContext, payload: &JsonValue) -> anyhow::Result<JsonValue> {
        Ok(json!({
            "echo": payload,
            "deliveryAttempt": ctx.delivery_attempt,
        }))
    }

    fn retryable(&self, _error: &anyhow::Error) -> bool {
        false
    }
}

/// Registry for the service binary.
pub fn default_registry() -> ProcessorRegistry {
    let mut registry = ProcessorRegistry::new();
    registry.register_with_timeout(ECHO_JOB_TYPE, EchoProcessor, Duration::from_secs(5));
    registry
}
