//! Topic/subscription abstraction (mechanics only).
//!
//! This module provides the **broker pattern** the pipeline is built on: producers send
//! messages to a topic, and every named subscription on that topic receives its own copy.
//! Consumers attached to the same subscription compete for messages (each delivery goes
//! to exactly one of them).
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a message stays owned by the subscription until it is settled.
//!   Unsettled messages (crashed consumer, expired lease) are delivered again.
//! - **No ordering guarantees**: across messages, or across redeliveries of one message.
//! - **Attempt counting**: the broker increments `delivery_attempt` on every redelivery.
//!   Consumers read it, they never write it.
//!
//! ## Settlement
//!
//! Every received message must end in exactly one [`Settlement`]:
//!
//! ```text
//! RECEIVED -> PROCESSING -> Ack            (done, remove)
//!                        -> DeadLetter     (terminal failure, park for inspection)
//!                        -> Nack           (redeliver after `retry_after`)
//! ```
//!
//! Retry timing lives with the consumer (it computes `retry_after`); the broker only
//! honours it. Consumers never sleep in-process waiting for a retry.
//!
//! ## Thread Safety
//!
//! Topics and subscriptions are `Send + Sync` and are shared through `Arc` by every
//! handler in a consumer pool.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Content type used for every message the pipeline sends.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message as delivered by a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Broker-assigned identifier (stream entry id, queue sequence, ...).
    pub id: String,
    pub body: Vec<u8>,
    pub content_type: String,
    /// 1-based delivery counter maintained by the broker.
    pub delivery_attempt: u32,
}

impl Message {
    pub fn new(id: impl Into<String>, body: Vec<u8>, delivery_attempt: u32) -> Self {
        Self {
            id: id.into(),
            body,
            content_type: JSON_CONTENT_TYPE.to_string(),
            delivery_attempt,
        }
    }
}

/// Final decision for a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Processing finished; remove the message.
    Ack,
    /// Terminal failure; remove the message from the subscription and park it.
    DeadLetter { reason: String },
    /// Leave the message unacknowledged and make it visible again after `retry_after`.
    Nack { retry_after: Duration },
}

impl Settlement {
    pub fn label(&self) -> &'static str {
        match self {
            Settlement::Ack => "ack",
            Settlement::DeadLetter { .. } => "dead_letter",
            Settlement::Nack { .. } => "nack",
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached (or the connection dropped).
    #[error("broker connection error: {0}")]
    Connection(String),

    /// The broker rejected or failed a command.
    #[error("broker command error: {0}")]
    Command(String),

    /// The subscription or topic was closed; no further messages will arrive.
    #[error("broker closed")]
    Closed,

    /// A settlement referenced a message the subscription does not hold.
    #[error("unknown message id: {0}")]
    UnknownMessage(String),
}

impl BrokerError {
    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Connection(_) | BrokerError::Command(_))
    }
}

/// Send side of a topic.
#[async_trait]
pub trait Topic: Send + Sync {
    /// Topic name (used for logging).
    fn name(&self) -> &str;

    /// Append a message; every subscription on the topic receives a copy.
    async fn send(&self, body: Vec<u8>) -> Result<(), BrokerError>;
}

/// Receive side of a named subscription.
#[async_trait]
pub trait Subscription: Send + Sync {
    /// Subscription name (used for logging).
    fn name(&self) -> &str;

    /// Wait for the next message.
    ///
    /// `Ok(None)` means nothing arrived within the implementation's poll window; callers
    /// loop. `Err(BrokerError::Closed)` means the subscription is finished.
    async fn receive(&self) -> Result<Option<Message>, BrokerError>;

    /// Settle a previously received message.
    async fn settle(&self, message: &Message, settlement: Settlement) -> Result<(), BrokerError>;
}

#[async_trait]
impl<T> Topic for std::sync::Arc<T>
where
    T: Topic + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn send(&self, body: Vec<u8>) -> Result<(), BrokerError> {
        (**self).send(body).await
    }
}

#[async_trait]
impl<T> Subscription for std::sync::Arc<T>
where
    T: Subscription + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn receive(&self) -> Result<Option<Message>, BrokerError> {
        (**self).receive().await
    }

    async fn settle(&self, message: &Message, settlement: Settlement) -> Result<(), BrokerError> {
        (**self).settle(message, settlement).await
    }
}
