use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use jobflow_core::JobId;

use crate::envelope::JobEnvelope;

/// Per-delivery context handed to a [`Processor`].
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub delivery_attempt: u32,
    /// When the producer enqueued the job, if it said so.
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Cancelled when the worker shuts down or the processing timeout fires.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn for_envelope(envelope: &JobEnvelope, cancel: CancellationToken) -> Self {
        Self {
            job_id: envelope.job_id().clone(),
            job_type: envelope.job_type().to_string(),
            delivery_attempt: envelope.delivery_attempt(),
            enqueued_at: envelope.enqueued_at(),
            cancel,
        }
    }
}

/// The unit of work registered for a job type.
///
/// Processors should be idempotent with respect to `job_id` where possible: with
/// at-least-once delivery the same job can run more than once.
#[async_trait]
pub trait Processor: Send + Sync {
    /// Run the job and return its result.
    async fn process(&self, ctx: &JobContext, payload: &JsonValue) -> anyhow::Result<JsonValue>;

    /// Whether a failure returned by [`Processor::process`] is worth another attempt.
    fn retryable(&self, error: &anyhow::Error) -> bool;

    /// Whether hitting the processing timeout is worth another attempt.
    fn retry_on_timeout(&self) -> bool {
        true
    }
}
