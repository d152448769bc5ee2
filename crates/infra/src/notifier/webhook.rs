//! Signed webhook relay.
//!
//! POSTs `{"clientId": ..., "event": ...}` to a relay URL that owns the client
//! connections. When a secret is configured each request carries:
//!
//! - `x-jobflow-timestamp`: unix seconds at signing time
//! - `x-jobflow-signature`: `sha256=<hex>` HMAC-SHA256 over `"<timestamp>.<body>"`

use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::debug;

use jobflow_core::ClientId;
use jobflow_events::{JobEvent, Notifier, NotifyError};

type HmacSha256 = Hmac<Sha256>;

pub const TIMESTAMP_HEADER: &str = "x-jobflow-timestamp";
pub const SIGNATURE_HEADER: &str = "x-jobflow-signature";

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: Option<String>,
    pub timeout: Duration,
}

impl WebhookConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = Some(secret.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Computes the `sha256=<hex>` signature for `body` sent at `timestamp`.
pub fn sign(secret: &[u8], timestamp: i64, body: &[u8]) -> Result<String, NotifyError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| NotifyError::Transport(format!("invalid webhook secret: {e}")))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookNotifier {
    pub fn new(config: WebhookConfig) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn push(&self, client_id: &ClientId, event: &JobEvent) -> Result<(), NotifyError> {
        let body = serde_json::to_vec(&json!({ "clientId": client_id, "event": event }))
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.config.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(secret) = &self.config.secret {
            let timestamp = chrono::Utc::now().timestamp();
            request = request
                .header(TIMESTAMP_HEADER, timestamp.to_string())
                .header(SIGNATURE_HEADER, sign(secret.as_bytes(), timestamp, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Transport(format!(
                "webhook relay responded with {status}"
            )));
        }

        debug!(client_id = %client_id, job_id = %event.job_id, %status, "webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_events::JobEnvelope;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn event() -> JobEvent {
        let env = JobEnvelope::new("j1", "chat.suggest", json!({}));
        JobEvent::completed(&env, json!({"suggestions": ["a", "b"]}), 12)
    }

    #[test]
    fn signature_covers_timestamp_and_body() {
        let a = sign(b"secret", 1_700_000_000, b"{}").unwrap();
        let b = sign(b"secret", 1_700_000_001, b"{}").unwrap();
        let c = sign(b"other", 1_700_000_000, b"{}").unwrap();

        assert!(a.starts_with("sha256="));
        assert_eq!(a.len(), "sha256=".len() + 64);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, sign(b"secret", 1_700_000_000, b"{}").unwrap());
    }

    #[tokio::test]
    async fn posts_signed_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/relay"))
            .and(header("content-type", "application/json"))
            .and(header_exists(TIMESTAMP_HEADER))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            WebhookConfig::new(format!("{}/relay", server.uri())).with_secret("s3cret"),
        )
        .unwrap();
        notifier.push(&ClientId::new("client-a"), &event()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let request = &requests[0];
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["clientId"], "client-a");
        assert_eq!(body["event"]["jobId"], "j1");

        let timestamp: i64 = request.headers[TIMESTAMP_HEADER].to_str().unwrap().parse().unwrap();
        let expected = sign(b"s3cret", timestamp, &request.body).unwrap();
        assert_eq!(request.headers[SIGNATURE_HEADER].to_str().unwrap(), expected);
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(WebhookConfig::new(server.uri())).unwrap();
        let err = notifier.push(&ClientId::new("client-a"), &event()).await.unwrap_err();
        assert!(matches!(err, NotifyError::Transport(msg) if msg.contains("503")));
    }
}
