//! [`Notifier`](jobflow_events::Notifier) implementations.

pub mod hub;
pub mod webhook;

pub use hub::ClientHub;
pub use webhook::{WebhookConfig, WebhookNotifier};
