//! Infrastructure layer: configuration, consumers, notifiers and broker adapters.

pub mod broker;
pub mod config;
pub mod notifier;
pub mod publisher;
#[cfg(feature = "redis")]
pub mod resolver;
pub mod retry;
pub mod workers;

pub use config::{PipelineConfig, PublishPolicy, TopologyConfig};
pub use notifier::{ClientHub, WebhookConfig, WebhookNotifier};
pub use publisher::{EventPublisher, PublishError};
#[cfg(feature = "redis")]
pub use resolver::RedisClientResolver;
pub use retry::RetryPolicy;
pub use workers::{ConsumerPool, DeliveryHandler, NotificationDispatcher, PoolStats, Worker};
