use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobflow_core::{JobError, JobId};

use crate::envelope::{CodecError, JobEnvelope};

/// Outcome carried by a [`JobEvent`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.failed")]
    JobFailed,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::JobCompleted => "job.completed",
            EventType::JobFailed => "job.failed",
        }
    }
}

/// Completion event published to the events topic after a delivery attempt.
///
/// `result` is only present on `job.completed`, `error` only on `job.failed`. A processor
/// returning JSON `null` produces a completed event without a `result`.
/// Consumers must expect duplicates per `job_id` (at-least-once delivery of jobs means a
/// job can finish more than once).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEvent {
    pub event_type: EventType,
    pub job_id: JobId,
    pub job_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    /// Time spent inside the processor call only.
    pub duration_ms: u64,
    #[serde(default = "default_attempt")]
    pub delivery_attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

fn default_attempt() -> u32 {
    1
}

impl JobEvent {
    /// Successful completion of `envelope`.
    pub fn completed(envelope: &JobEnvelope, result: JsonValue, duration_ms: u64) -> Self {
        Self {
            event_type: EventType::JobCompleted,
            job_id: envelope.job_id().clone(),
            job_type: envelope.job_type().to_string(),
            result: (!result.is_null()).then_some(result),
            error: None,
            duration_ms,
            delivery_attempt: envelope.delivery_attempt(),
            occurred_at: Utc::now(),
        }
    }

    /// Failure of `envelope`.
    pub fn failed(envelope: &JobEnvelope, error: JobError, duration_ms: u64) -> Self {
        Self::failed_for(
            envelope.job_id().clone(),
            envelope.job_type(),
            envelope.delivery_attempt(),
            error,
            duration_ms,
        )
    }

    /// Failure for a job whose envelope could not be decoded.
    pub fn failed_for(
        job_id: JobId,
        job_type: impl Into<String>,
        delivery_attempt: u32,
        error: JobError,
        duration_ms: u64,
    ) -> Self {
        Self {
            event_type: EventType::JobFailed,
            job_id,
            job_type: job_type.into(),
            result: None,
            error: Some(error),
            duration_ms,
            delivery_attempt,
            occurred_at: Utc::now(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.event_type == EventType::JobCompleted
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let event: JobEvent = serde_json::from_slice(bytes)?;
        match (event.event_type, &event.result, &event.error) {
            (EventType::JobCompleted, _, Some(_)) => {
                Err(CodecError::Invalid("job.completed must not carry an error".into()))
            }
            (EventType::JobFailed, _, None) => {
                Err(CodecError::Invalid("job.failed must carry an error".into()))
            }
            _ => Ok(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::ErrorKind;
    use serde_json::json;

    #[test]
    fn completed_event_wire_shape() {
        let env = JobEnvelope::new("j1", "chat.suggest", json!({"fanMessage": "hi"}));
        let event = JobEvent::completed(&env, json!({"suggestions": ["a", "b"]}), 12);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventType"], "job.completed");
        assert_eq!(value["jobId"], "j1");
        assert_eq!(value["jobType"], "chat.suggest");
        assert_eq!(value["result"], json!({"suggestions": ["a", "b"]}));
        assert_eq!(value["durationMs"], 12);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn null_result_is_omitted() {
        let env = JobEnvelope::new("j4", "system.noop", json!({}));
        let event = JobEvent::completed(&env, JsonValue::Null, 1);
        assert_eq!(event.result, None);

        let bytes = event.encode().unwrap();
        let value: JsonValue = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("result").is_none());
        assert_eq!(JobEvent::decode(&bytes).unwrap(), event);
    }

    #[test]
    fn failed_event_wire_shape() {
        let env = JobEnvelope::new("j2", "content.analyze", json!(null));
        let event = JobEvent::failed(&env, JobError::unknown_job_type("content.analyze"), 0);

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["eventType"], "job.failed");
        assert_eq!(value["error"]["kind"], "UNKNOWN_JOB_TYPE");
        assert_eq!(value["error"]["retryable"], false);
        assert!(value.get("result").is_none());
    }

    #[test]
    fn decode_rejects_inconsistent_events() {
        let env = JobEnvelope::new("j3", "t", json!({}));
        let mut event = JobEvent::failed(&env, JobError::processor("boom", false), 5);
        let back = JobEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(back.error.as_ref().map(|e| e.kind), Some(ErrorKind::ProcessorError));

        event.error = None;
        assert!(JobEvent::decode(&event.encode().unwrap()).is_err());
    }
}
