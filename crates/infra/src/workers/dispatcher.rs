//! Notification dispatcher: completion events out to connected clients.
//!
//! Runs on its own subscription of the events topic, so a slow or failing notifier never
//! holds up job processing. Every event message is acked exactly once, whatever happens
//! to the notification; nothing is ever requeued as a job.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use jobflow_events::{
    BrokerError, ClientResolver, JobEvent, Message, Notifier, Settlement, Subscription,
};

use crate::config::PipelineConfig;
use crate::workers::pool::{ConsumerPool, DeliveryHandler, PoolStats};

pub struct NotificationDispatcher {
    resolver: Arc<dyn ClientResolver>,
    notifier: Arc<dyn Notifier>,
}

impl NotificationDispatcher {
    pub fn new(resolver: Arc<dyn ClientResolver>, notifier: Arc<dyn Notifier>) -> Self {
        Self { resolver, notifier }
    }

    /// Consume `subscription` until `cancel` fires or the subscription closes.
    pub async fn run(
        self: Arc<Self>,
        cancel: CancellationToken,
        subscription: Arc<dyn Subscription>,
        config: &PipelineConfig,
    ) -> Result<PoolStats, BrokerError> {
        let name = format!("dispatcher:{}", subscription.name());
        ConsumerPool::new(name, subscription, self)
            .with_concurrency(config.concurrency)
            .with_shutdown_grace(config.shutdown_grace)
            .run(cancel)
            .await
    }

    /// Forward one event message. Failures are logged, never propagated.
    pub async fn dispatch(&self, message: &Message) {
        let event = match JobEvent::decode(&message.body) {
            Ok(event) => event,
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "dropping undecodable job event");
                return;
            }
        };

        let client_id = match self.resolver.resolve(&event.job_id).await {
            Ok(Some(client_id)) => client_id,
            Ok(None) => {
                warn!(job_id = %event.job_id, "no client waiting for job; event dropped");
                return;
            }
            Err(err) => {
                warn!(job_id = %event.job_id, error = %err, "client lookup failed; event dropped");
                return;
            }
        };

        match self.notifier.push(&client_id, &event).await {
            Ok(()) => info!(
                job_id = %event.job_id,
                client_id = %client_id,
                event_type = event.event_type.as_str(),
                "client notified"
            ),
            Err(err) => warn!(
                job_id = %event.job_id,
                client_id = %client_id,
                error = %err,
                "client notification failed"
            ),
        }
    }
}

#[async_trait]
impl DeliveryHandler for NotificationDispatcher {
    async fn handle(&self, message: &Message, _cancel: &CancellationToken) -> Settlement {
        self.dispatch(message).await;
        debug!(message_id = %message.id, "event message acked");
        Settlement::Ack
    }
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use jobflow_core::{ClientId, JobId};
    use jobflow_events::{InMemoryClientResolver, JobEnvelope, NotifyError};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        pushed: Mutex<Vec<(ClientId, JobId)>>,
    }

    #[async_trait]
    impl Notifier for Recorder {
        async fn push(&self, client_id: &ClientId, event: &JobEvent) -> Result<(), NotifyError> {
            self.pushed
                .lock()
                .unwrap()
                .push((client_id.clone(), event.job_id.clone()));
            Ok(())
        }
    }

    fn event_message(job_id: &str) -> Message {
        let env = JobEnvelope::new(job_id, "chat.suggest", json!({}));
        let event = JobEvent::completed(&env, json!({"suggestions": []}), 5);
        Message::new("e-1", event.encode().unwrap(), 1)
    }

    #[tokio::test]
    async fn forwards_to_the_resolved_client() {
        let resolver = Arc::new(InMemoryClientResolver::new());
        resolver.insert("j1", "client-a");
        let notifier = Arc::new(Recorder::default());
        let dispatcher = NotificationDispatcher::new(resolver, notifier.clone());

        let settlement = dispatcher
            .handle(&event_message("j1"), &CancellationToken::new())
            .await;

        assert_eq!(settlement, Settlement::Ack);
        let pushed = notifier.pushed.lock().unwrap();
        assert_eq!(*pushed, vec![(ClientId::new("client-a"), JobId::new("j1"))]);
    }

    #[tokio::test]
    async fn unresolved_and_garbage_messages_are_acked() {
        let notifier = Arc::new(Recorder::default());
        let dispatcher =
            NotificationDispatcher::new(Arc::new(InMemoryClientResolver::new()), notifier.clone());

        let cancel = CancellationToken::new();
        assert_eq!(dispatcher.handle(&event_message("j1"), &cancel).await, Settlement::Ack);
        let garbage = Message::new("e-2", b"{}".to_vec(), 1);
        assert_eq!(dispatcher.handle(&garbage, &cancel).await, Settlement::Ack);

        assert!(notifier.pushed.lock().unwrap().is_empty());
    }
}
