//! Job worker: envelope in, completion event out.
//!
//! Every delivery attempt ends in exactly one published [`JobEvent`] and one settlement:
//!
//! | Outcome | Event | Settlement |
//! |---------|-------|------------|
//! | processor succeeded | `job.completed` | `Ack` |
//! | undecodable body, unknown job type, non-retryable failure or panic | `job.failed` | `DeadLetter` |
//! | retryable failure, attempts left | `job.failed` (`retryable: true`) | `Nack` with backoff |
//! | retryable failure, budget spent | `job.failed` (`MAX_RETRIES_EXCEEDED`) | `DeadLetter` |
//! | event could not be published | none | `Nack` with backoff |

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{error, info, warn};

use jobflow_core::{ErrorKind, JobError};
use jobflow_events::envelope::salvage_correlation;
use jobflow_events::{
    BrokerError, JobContext, JobEnvelope, JobEvent, Message, ProcessorRegistry, Settlement,
    Subscription,
};

use crate::config::PipelineConfig;
use crate::publisher::EventPublisher;
use crate::workers::pool::{ConsumerPool, DeliveryHandler, PoolStats};

/// Terminal state of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageState {
    AckSuccess,
    AckFailedTerminal,
    NackRetry,
}

impl MessageState {
    fn label(self) -> &'static str {
        match self {
            MessageState::AckSuccess => "ack_success",
            MessageState::AckFailedTerminal => "ack_failed_terminal",
            MessageState::NackRetry => "nack_retry",
        }
    }
}

pub struct Worker {
    registry: Arc<ProcessorRegistry>,
    publisher: EventPublisher,
    config: PipelineConfig,
}

impl Worker {
    pub fn new(
        registry: Arc<ProcessorRegistry>,
        publisher: EventPublisher,
        config: PipelineConfig,
    ) -> Self {
        Self {
            registry,
            publisher,
            config,
        }
    }

    /// Consume `subscription` with `config.concurrency` envelopes in flight.
    ///
    /// Returns after `cancel` fires and in-flight jobs drained, when the subscription
    /// closes, or on an unrecoverable broker error.
    pub async fn run(
        cancel: CancellationToken,
        subscription: Arc<dyn Subscription>,
        registry: Arc<ProcessorRegistry>,
        publisher: EventPublisher,
        config: PipelineConfig,
    ) -> Result<PoolStats, BrokerError> {
        let name = format!("worker:{}", subscription.name());
        let concurrency = config.concurrency;
        let grace = config.shutdown_grace;
        info!(
            job_types = ?registry.job_types().collect::<Vec<_>>(),
            events = %publisher.topic_name(),
            "starting job worker"
        );

        let worker = Arc::new(Worker::new(registry, publisher, config));
        ConsumerPool::new(name, subscription, worker)
            .with_concurrency(concurrency)
            .with_shutdown_grace(grace)
            .run(cancel)
            .await
    }

    /// Process one delivered message and decide its settlement.
    pub async fn process_message(&self, message: &Message, cancel: &CancellationToken) -> Settlement {
        let envelope = match JobEnvelope::from_message(message) {
            Ok(envelope) => envelope,
            Err(err) => {
                let (job_id, job_type) = salvage_correlation(message);
                let event = JobEvent::failed_for(
                    job_id,
                    job_type,
                    message.delivery_attempt.max(1),
                    JobError::decode(err.to_string()),
                    0,
                );
                return self.finish(event, MessageState::AckFailedTerminal).await;
            }
        };

        let Some(registration) = self.registry.lookup(envelope.job_type()) else {
            let error = JobError::unknown_job_type(envelope.job_type());
            let event = JobEvent::failed(&envelope, error, 0);
            return self.finish(event, MessageState::AckFailedTerminal).await;
        };

        let processor = registration.processor();
        let timeout = registration.timeout().unwrap_or(self.config.processing_timeout);
        let job_cancel = cancel.child_token();
        let ctx = JobContext::for_envelope(&envelope, job_cancel.clone());

        // Own task so a panicking processor fails the job instead of the handler.
        let run = AbortOnDropHandle::new(tokio::spawn({
            let processor = processor.clone();
            let payload = envelope.payload().clone();
            async move { processor.process(&ctx, &payload).await }
        }));

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, run).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let error = match result {
            Ok(Ok(Ok(output))) => {
                let event = JobEvent::completed(&envelope, output, duration_ms);
                return self.finish(event, MessageState::AckSuccess).await;
            }
            Ok(Ok(Err(err))) => JobError::processor(format!("{err:#}"), processor.retryable(&err)),
            Ok(Err(join_err)) if join_err.is_panic() => {
                JobError::processor(panic_message(join_err), false)
            }
            Ok(Err(_)) => JobError::processor("processor task cancelled", true),
            Err(_) => {
                job_cancel.cancel();
                JobError::timeout(timeout.as_millis() as u64, processor.retry_on_timeout())
            }
        };

        let (error, state) = self.classify(&envelope, error);
        self.finish(JobEvent::failed(&envelope, error, duration_ms), state)
            .await
    }

    /// Apply the attempt budget to a processing failure.
    fn classify(&self, envelope: &JobEnvelope, error: JobError) -> (JobError, MessageState) {
        if !error.retryable {
            return (error, MessageState::AckFailedTerminal);
        }

        let attempt = envelope.delivery_attempt();
        if self.config.retry.should_retry(attempt) {
            (error, MessageState::NackRetry)
        } else {
            (
                JobError::max_retries_exceeded(attempt, &error),
                MessageState::AckFailedTerminal,
            )
        }
    }

    /// Publish the attempt's event, log the outcome and pick the settlement.
    async fn finish(&self, event: JobEvent, state: MessageState) -> Settlement {
        let attempt = event.delivery_attempt;

        if let Err(err) = self.publisher.publish(&event).await {
            let retry_after = self.config.retry.delay_for_attempt(attempt);
            error!(
                job_id = %event.job_id,
                job_type = %event.job_type,
                duration_ms = event.duration_ms,
                delivery_attempt = attempt,
                outcome = MessageState::NackRetry.label(),
                error_kind = ErrorKind::PublishFailure.as_str(),
                retry_after_ms = retry_after.as_millis() as u64,
                error = %err,
                "completion event not published; job will be retried"
            );
            return Settlement::Nack { retry_after };
        }

        match &event.error {
            None => info!(
                job_id = %event.job_id,
                job_type = %event.job_type,
                duration_ms = event.duration_ms,
                delivery_attempt = attempt,
                outcome = state.label(),
                "job completed"
            ),
            Some(job_error) => warn!(
                job_id = %event.job_id,
                job_type = %event.job_type,
                duration_ms = event.duration_ms,
                delivery_attempt = attempt,
                outcome = state.label(),
                error_kind = job_error.kind.as_str(),
                retryable = job_error.retryable,
                error = %job_error.message,
                "job failed"
            ),
        }

        match state {
            MessageState::AckSuccess => Settlement::Ack,
            MessageState::AckFailedTerminal => Settlement::DeadLetter {
                reason: event
                    .error
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "terminal failure".to_string()),
            },
            MessageState::NackRetry => Settlement::Nack {
                retry_after: self.config.retry.delay_for_attempt(attempt),
            },
        }
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("processor panicked: {detail}")
}

#[async_trait]
impl DeliveryHandler for Worker {
    async fn handle(&self, message: &Message, cancel: &CancellationToken) -> Settlement {
        self.process_message(message, cancel).await
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("registry", &self.registry)
            .field("publisher", &self.publisher)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use jobflow_events::{EventType, InMemoryBroker, InMemorySubscription, Processor};
    use serde_json::{Value as JsonValue, json};

    use crate::config::PublishPolicy;
    use crate::retry::RetryPolicy;

    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        async fn process(&self, _ctx: &JobContext, payload: &JsonValue) -> anyhow::Result<JsonValue> {
            Ok(payload.clone())
        }

        fn retryable(&self, _error: &anyhow::Error) -> bool {
            false
        }
    }

    /// Waits on the cancellation token; only the timeout ends it.
    struct Hang {
        retry_on_timeout: bool,
    }

    #[async_trait]
    impl Processor for Hang {
        async fn process(&self, ctx: &JobContext, _payload: &JsonValue) -> anyhow::Result<JsonValue> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(json!({"cancelled": ctx.cancel.is_cancelled()}))
        }

        fn retryable(&self, _error: &anyhow::Error) -> bool {
            true
        }

        fn retry_on_timeout(&self) -> bool {
            self.retry_on_timeout
        }
    }

    fn harness(registry: ProcessorRegistry) -> (Worker, InMemorySubscription) {
        let broker = InMemoryBroker::new();
        let events = broker.subscribe("events", "probe");
        let publisher = EventPublisher::new(Arc::new(broker.topic("events")), PublishPolicy::default());
        let config = PipelineConfig::default()
            .with_processing_timeout(Duration::from_secs(1))
            .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(2)));
        (Worker::new(Arc::new(registry), publisher, config), events)
    }

    async fn next_event(events: &InMemorySubscription) -> JobEvent {
        let message = events.receive().await.unwrap().unwrap();
        events.settle(&message, Settlement::Ack).await.unwrap();
        JobEvent::decode(&message.body).unwrap()
    }

    fn job_message(body: JsonValue, attempt: u32) -> Message {
        Message::new("m-1", serde_json::to_vec(&body).unwrap(), attempt)
    }

    #[tokio::test]
    async fn success_is_acked_with_completed_event() {
        let mut registry = ProcessorRegistry::new();
        registry.register("system.echo", Echo);
        let (worker, events) = harness(registry);

        let message = job_message(
            json!({"jobId": "j1", "jobType": "system.echo", "payload": {"x": 1}}),
            1,
        );
        let settlement = worker.process_message(&message, &CancellationToken::new()).await;

        assert_eq!(settlement, Settlement::Ack);
        let event = next_event(&events).await;
        assert_eq!(event.event_type, EventType::JobCompleted);
        assert_eq!(event.result, Some(json!({"x": 1})));
    }

    #[tokio::test]
    async fn producer_json_without_timestamp_completes() {
        let mut registry = ProcessorRegistry::new();
        registry.register("chat.suggest", Echo);
        let (worker, events) = harness(registry);

        let body = br#"{"jobId":"j1","jobType":"chat.suggest","payload":{"fanMessage":"hi"}}"#;
        let message = Message::new("m-1", body.to_vec(), 1);
        let settlement = worker.process_message(&message, &CancellationToken::new()).await;

        assert_eq!(settlement, Settlement::Ack);
        let event = next_event(&events).await;
        assert_eq!(event.event_type, EventType::JobCompleted);
        assert_eq!(event.job_id.as_str(), "j1");
        assert_eq!(event.result, Some(json!({"fanMessage": "hi"})));
    }

    #[tokio::test]
    async fn garbage_body_salvages_correlation() {
        let (worker, events) = harness(ProcessorRegistry::new());

        let message = job_message(json!({"jobId": "j9", "jobType": "chat.suggest", "payload": 1, "enqueuedAt": 7}), 1);
        let settlement = worker.process_message(&message, &CancellationToken::new()).await;

        assert!(matches!(settlement, Settlement::DeadLetter { .. }));
        let event = next_event(&events).await;
        assert_eq!(event.job_id.as_str(), "j9");
        assert_eq!(event.job_type, "chat.suggest");
        assert_eq!(event.duration_ms, 0);
        let error = event.error.unwrap();
        assert_eq!(error.kind, ErrorKind::DecodeError);
        assert!(!error.retryable);

        let message = Message::new("m-2", b"not json".to_vec(), 1);
        worker.process_message(&message, &CancellationToken::new()).await;
        let event = next_event(&events).await;
        assert_eq!(event.job_id.as_str(), "m-2");
        assert_eq!(event.job_type, "unknown");
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_follows_processor_preference() {
        let mut registry = ProcessorRegistry::new();
        registry
            .register("slow.retry", Hang { retry_on_timeout: true })
            .register_with_timeout(
                "slow.final",
                Hang { retry_on_timeout: false },
                Duration::from_millis(200),
            );
        let (worker, events) = harness(registry);

        let message = job_message(json!({"jobId": "a", "jobType": "slow.retry"}), 1);
        let settlement = worker.process_message(&message, &CancellationToken::new()).await;
        assert_eq!(
            settlement,
            Settlement::Nack {
                retry_after: Duration::from_secs(2)
            }
        );
        let event = next_event(&events).await;
        let error = event.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert!(error.retryable);
        assert_eq!(event.duration_ms, 1000);

        let message = job_message(json!({"jobId": "b", "jobType": "slow.final"}), 1);
        let settlement = worker.process_message(&message, &CancellationToken::new()).await;
        assert!(matches!(settlement, Settlement::DeadLetter { .. }));
        let event = next_event(&events).await;
        assert_eq!(event.duration_ms, 200);
        assert!(!event.error.unwrap().retryable);
    }

    struct Explode;

    #[async_trait]
    impl Processor for Explode {
        async fn process(&self, _ctx: &JobContext, _payload: &JsonValue) -> anyhow::Result<JsonValue> {
            panic!("index out of range");
        }

        fn retryable(&self, _error: &anyhow::Error) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn panicking_processor_fails_the_job() {
        let mut registry = ProcessorRegistry::new();
        registry.register("chat.suggest", Explode);
        let (worker, events) = harness(registry);

        let message = job_message(json!({"jobId": "j5", "jobType": "chat.suggest"}), 1);
        let settlement = worker.process_message(&message, &CancellationToken::new()).await;

        assert!(matches!(settlement, Settlement::DeadLetter { .. }));
        let event = next_event(&events).await;
        assert_eq!(event.job_id.as_str(), "j5");
        let error = event.error.unwrap();
        assert_eq!(error.kind, ErrorKind::ProcessorError);
        assert!(!error.retryable);
        assert!(error.message.contains("index out of range"), "{}", error.message);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_reports_max_retries() {
        let mut registry = ProcessorRegistry::new();
        registry.register("slow.retry", Hang { retry_on_timeout: true });
        let (worker, events) = harness(registry);

        let message = job_message(json!({"jobId": "a", "jobType": "slow.retry"}), 3);
        let settlement = worker.process_message(&message, &CancellationToken::new()).await;

        assert!(matches!(settlement, Settlement::DeadLetter { .. }));
        let error = next_event(&events).await.error.unwrap();
        assert_eq!(error.kind, ErrorKind::MaxRetriesExceeded);
        assert!(!error.retryable);
        assert!(error.message.contains("TIMEOUT"));
    }
}
