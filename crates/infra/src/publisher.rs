//! Completion-event publisher.
//!
//! Serializes [`JobEvent`]s onto the events topic. Transient broker errors are retried
//! with a fixed backoff; everything else surfaces immediately so the worker can decide
//! what happens to the job message.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use jobflow_events::{BrokerError, CodecError, JobEvent, Topic};

use crate::config::PublishPolicy;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event serialization failed: {0}")]
    Serialization(#[from] CodecError),

    #[error("event publish failed after {attempts} attempt(s): {source}")]
    Broker {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
}

#[derive(Clone)]
pub struct EventPublisher {
    topic: Arc<dyn Topic>,
    policy: PublishPolicy,
}

impl EventPublisher {
    pub fn new(topic: Arc<dyn Topic>, policy: PublishPolicy) -> Self {
        Self { topic, policy }
    }

    pub fn topic_name(&self) -> &str {
        self.topic.name()
    }

    /// Publish `event`, retrying transient send failures up to the policy budget.
    pub async fn publish(&self, event: &JobEvent) -> Result<(), PublishError> {
        let body = event.encode()?;
        let max_attempts = self.policy.retries.saturating_add(1);
        let mut attempt = 1;

        loop {
            match self.topic.send(body.clone()).await {
                Ok(()) => {
                    debug!(
                        topic = %self.topic.name(),
                        job_id = %event.job_id,
                        event_type = event.event_type.as_str(),
                        attempt,
                        "published job event"
                    );
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    warn!(
                        topic = %self.topic.name(),
                        job_id = %event.job_id,
                        attempt,
                        error = %err,
                        "event publish failed; retrying"
                    );
                    tokio::time::sleep(self.policy.backoff).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(PublishError::Broker {
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("topic", &self.topic.name())
            .field("policy", &self.policy)
            .finish()
    }
}
