use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use jobflow_core::JobId;

use crate::broker::Message;

/// Envelope for a job, as published to the job topic.
///
/// Notes:
/// - `job_id` is assigned by the producer and never changes; it is copied verbatim into
///   every completion event for this job.
/// - `payload` is opaque to the pipeline; only the processor for `job_type` reads it.
/// - `enqueued_at` is optional on the wire; producers that omit it get `None`.
/// - `delivery_attempt` belongs to the broker. [`JobEnvelope::from_message`] overwrites
///   whatever the body says with the broker's own count.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    job_id: JobId,
    job_type: String,
    #[serde(default)]
    payload: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    enqueued_at: Option<DateTime<Utc>>,
    #[serde(default = "first_attempt")]
    delivery_attempt: u32,
}

fn first_attempt() -> u32 {
    1
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed json: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid envelope: {0}")]
    Invalid(String),
}

impl JobEnvelope {
    pub fn new(job_id: impl Into<JobId>, job_type: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            job_id: job_id.into(),
            job_type: job_type.into(),
            payload,
            enqueued_at: Some(Utc::now()),
            delivery_attempt: 1,
        }
    }

    pub fn with_enqueued_at(mut self, at: DateTime<Utc>) -> Self {
        self.enqueued_at = Some(at);
        self
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn enqueued_at(&self) -> Option<DateTime<Utc>> {
        self.enqueued_at
    }

    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse the JSON wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let envelope: JobEnvelope = serde_json::from_slice(bytes)?;
        if envelope.job_id.as_str().trim().is_empty() {
            return Err(CodecError::Invalid("jobId must not be empty".into()));
        }
        if envelope.job_type.trim().is_empty() {
            return Err(CodecError::Invalid("jobType must not be empty".into()));
        }
        Ok(envelope)
    }

    /// Decode a delivered message, taking the delivery attempt from the broker.
    pub fn from_message(message: &Message) -> Result<Self, CodecError> {
        let mut envelope = Self::decode(&message.body)?;
        envelope.delivery_attempt = message.delivery_attempt.max(1);
        Ok(envelope)
    }
}

/// Best-effort correlation for a body that failed to decode.
///
/// Pulls `jobId`/`jobType` out of whatever JSON object is there, so the failure event
/// can still be matched to the producer's job. Falls back to the broker message id and
/// `"unknown"`.
pub fn salvage_correlation(message: &Message) -> (JobId, String) {
    let raw: Option<JsonValue> = serde_json::from_slice(&message.body).ok();
    let field = |name: &str| {
        raw.as_ref()
            .and_then(|v| v.get(name))
            .and_then(JsonValue::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    };

    let job_id = field("jobId").unwrap_or_else(|| message.id.clone());
    let job_type = field("jobType").unwrap_or_else(|| "unknown".to_string());
    (JobId::new(job_id), job_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn decodes_producer_json() {
        let body = br#"{
            "jobId": "j1",
            "jobType": "chat.suggest",
            "payload": {"fanMessage": "hi"},
            "enqueuedAt": "2026-01-01T00:00:00Z"
        }"#;

        let env = JobEnvelope::decode(body).unwrap();
        assert_eq!(env.job_id().as_str(), "j1");
        assert_eq!(env.job_type(), "chat.suggest");
        assert_eq!(env.payload(), &json!({"fanMessage": "hi"}));
        assert_eq!(env.delivery_attempt(), 1);
        assert_eq!(
            env.enqueued_at(),
            DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .ok()
                .map(|at| at.with_timezone(&Utc))
        );
    }

    #[test]
    fn enqueued_at_is_optional() {
        let body = br#"{"jobId":"j1","jobType":"chat.suggest","payload":{"fanMessage":"hi"}}"#;

        let env = JobEnvelope::decode(body).unwrap();
        assert_eq!(env.job_id().as_str(), "j1");
        assert_eq!(env.enqueued_at(), None);

        let value: JsonValue = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert!(value.get("enqueuedAt").is_none());
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let body = br#"{"jobId":"j1","jobType":"t","payload":null,
            "enqueuedAt":"2026-01-01T00:00:00Z","schema":"v9","priority":3}"#;
        assert!(JobEnvelope::decode(body).is_ok());
    }

    #[test]
    fn broker_attempt_wins_over_body() {
        let env = JobEnvelope::new("j1", "t", json!({}));
        let mut msg = Message::new("1-0", env.encode().unwrap(), 4);
        assert_eq!(JobEnvelope::from_message(&msg).unwrap().delivery_attempt(), 4);

        msg.delivery_attempt = 0;
        assert_eq!(JobEnvelope::from_message(&msg).unwrap().delivery_attempt(), 1);
    }

    #[test]
    fn rejects_garbage_and_blank_ids() {
        assert!(matches!(JobEnvelope::decode(b"not json"), Err(CodecError::Malformed(_))));

        let blank = br#"{"jobId":" ","jobType":"t","enqueuedAt":"2026-01-01T00:00:00Z"}"#;
        assert!(matches!(JobEnvelope::decode(blank), Err(CodecError::Invalid(_))));
    }

    #[test]
    fn salvage_prefers_body_fields() {
        let partial = Message::new("7-0", br#"{"jobId":"j9","jobType":"x.y"}"#.to_vec(), 1);
        let (id, ty) = salvage_correlation(&partial);
        assert_eq!(id.as_str(), "j9");
        assert_eq!(ty, "x.y");

        let garbage = Message::new("7-1", b"\x00\x01".to_vec(), 1);
        let (id, ty) = salvage_correlation(&garbage);
        assert_eq!(id.as_str(), "7-1");
        assert_eq!(ty, "unknown");
    }

    fn payload_strategy() -> impl Strategy<Value = JsonValue> {
        let leaf = prop_oneof![
            Just(JsonValue::Null),
            any::<bool>().prop_map(JsonValue::from),
            any::<i64>().prop_map(JsonValue::from),
            "[a-zA-Z0-9 ]{0,16}".prop_map(JsonValue::from),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(JsonValue::from),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| JsonValue::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            job_id in "[a-zA-Z0-9_-]{1,24}",
            job_type in "[a-z]{1,8}\\.[a-z]{1,8}",
            payload in payload_strategy(),
            secs in 0i64..4_000_000_000,
        ) {
            let at = DateTime::<Utc>::from_timestamp(secs, 0).unwrap();
            let env = JobEnvelope::new(job_id, job_type, payload).with_enqueued_at(at);
            let back = JobEnvelope::decode(&env.encode().unwrap()).unwrap();
            prop_assert_eq!(back, env);
        }
    }
}
