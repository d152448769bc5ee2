//! Pipeline error model.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed job delivery.
///
/// Serialized as `SCREAMING_SNAKE_CASE` on the events topic.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// The job message could not be decoded into an envelope.
    DecodeError,
    /// No processor is registered for the envelope's job type.
    UnknownJobType,
    /// The processor did not finish within its processing timeout.
    Timeout,
    /// The processor returned an error.
    ProcessorError,
    /// A retryable failure happened on the last allowed delivery attempt.
    MaxRetriesExceeded,
    /// The completion event could not be published.
    PublishFailure,
}

impl ErrorKind {
    /// Kinds that are never retried, regardless of what the processor says.
    pub fn is_always_terminal(self) -> bool {
        matches!(
            self,
            ErrorKind::DecodeError
                | ErrorKind::UnknownJobType
                | ErrorKind::MaxRetriesExceeded
                | ErrorKind::PublishFailure
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DecodeError => "DECODE_ERROR",
            ErrorKind::UnknownJobType => "UNKNOWN_JOB_TYPE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ProcessorError => "PROCESSOR_ERROR",
            ErrorKind::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorKind::PublishFailure => "PUBLISH_FAILURE",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error description carried by `job.failed` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl JobError {
    /// Build an error; kinds that are always terminal force `retryable = false`.
    pub fn new(kind: ErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: retryable && !kind.is_always_terminal(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::DecodeError, message, false)
    }

    pub fn unknown_job_type(job_type: &str) -> Self {
        Self::new(
            ErrorKind::UnknownJobType,
            format!("no processor registered for job type '{job_type}'"),
            false,
        )
    }

    pub fn timeout(after_ms: u64, retryable: bool) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("processing timed out after {after_ms}ms"),
            retryable,
        )
    }

    pub fn processor(message: impl Into<String>, retryable: bool) -> Self {
        Self::new(ErrorKind::ProcessorError, message, retryable)
    }

    /// Wrap the last retryable failure once the attempt budget is spent.
    pub fn max_retries_exceeded(attempts: u32, last: &JobError) -> Self {
        Self::new(
            ErrorKind::MaxRetriesExceeded,
            format!("gave up after {attempts} attempts; last error: {last}"),
            false,
        )
    }
}

/// Identifier parse failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorKind::UnknownJobType).unwrap();
        assert_eq!(json, "\"UNKNOWN_JOB_TYPE\"");

        let kind: ErrorKind = serde_json::from_str("\"MAX_RETRIES_EXCEEDED\"").unwrap();
        assert_eq!(kind, ErrorKind::MaxRetriesExceeded);
        assert_eq!(kind.to_string(), "MAX_RETRIES_EXCEEDED");
    }

    #[test]
    fn terminal_kinds_are_never_retryable() {
        assert!(!JobError::new(ErrorKind::DecodeError, "x", true).retryable);
        assert!(!JobError::new(ErrorKind::PublishFailure, "x", true).retryable);
        assert!(JobError::new(ErrorKind::Timeout, "x", true).retryable);
        assert!(!JobError::processor("bad input", false).retryable);
    }

    #[test]
    fn job_error_wire_shape() {
        let err = JobError::timeout(30_000, true);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["kind"], "TIMEOUT");
        assert_eq!(value["retryable"], true);
        assert_eq!(value["message"], "processing timed out after 30000ms");
    }
}
