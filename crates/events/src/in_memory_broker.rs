//! In-memory broker for tests/dev.
//!
//! - Named topics, each with named subscriptions (every subscription gets a copy)
//! - Competing consumers on one subscription share a single queue
//! - Nack schedules a delayed redelivery with `delivery_attempt + 1`
//! - Unsettled messages come back after the lease timeout
//! - No persistence: everything is lost with the process

use std::collections::{HashMap, VecDeque};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::broker::{BrokerError, Message, Settlement, Subscription, Topic};

const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);

/// A message parked after a terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: String,
}

#[derive(Debug, Clone)]
struct Entry {
    id: String,
    body: Vec<u8>,
    attempt: u32,
}

impl Entry {
    fn to_message(&self) -> Message {
        Message::new(self.id.clone(), self.body.clone(), self.attempt)
    }
}

#[derive(Debug, Default)]
struct Queue {
    ready: VecDeque<Entry>,
    delayed: Vec<(Instant, Entry)>,
    in_flight: HashMap<String, (Instant, Entry)>,
    dead_letters: Vec<DeadLetter>,
    acked: u64,
}

impl Queue {
    /// Move due redeliveries and expired leases back to `ready`.
    fn promote(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.delayed.len() {
            if self.delayed[i].0 <= now {
                let (_, entry) = self.delayed.swap_remove(i);
                self.ready.push_back(entry);
            } else {
                i += 1;
            }
        }

        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, (deadline, _))| *deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some((_, mut entry)) = self.in_flight.remove(&id) {
                entry.attempt += 1;
                self.ready.push_back(entry);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let delayed = self.delayed.iter().map(|(at, _)| *at);
        let leases = self.in_flight.values().map(|(deadline, _)| *deadline);
        delayed.chain(leases).min()
    }
}

#[derive(Debug)]
struct SubState {
    name: String,
    lease_timeout: Duration,
    queue: Mutex<Queue>,
    notify: Notify,
    closed: AtomicBool,
}

impl SubState {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Queue>, BrokerError> {
        self.queue
            .lock()
            .map_err(|_| BrokerError::Command(format!("subscription {} lock poisoned", self.name)))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[derive(Debug)]
struct TopicState {
    name: String,
    subscriptions: Mutex<HashMap<String, Arc<SubState>>>,
}

#[derive(Debug)]
struct BrokerInner {
    topics: Mutex<HashMap<String, Arc<TopicState>>>,
    lease_timeout: Duration,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// In-memory topic/subscription broker.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::with_lease_timeout(DEFAULT_LEASE_TIMEOUT)
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker whose unsettled deliveries become visible again after `lease_timeout`.
    pub fn with_lease_timeout(lease_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: Mutex::new(HashMap::new()),
                lease_timeout,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn topic_state(&self, name: &str) -> Arc<TopicState> {
        // A poisoned map only happens after a panic elsewhere; keep serving.
        let mut topics = match self.inner.topics.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TopicState {
                    name: name.to_string(),
                    subscriptions: Mutex::new(HashMap::new()),
                })
            })
            .clone()
    }

    /// Handle for sending to `name` (created on first use).
    pub fn topic(&self, name: &str) -> InMemoryTopic {
        InMemoryTopic {
            broker: self.clone(),
            state: self.topic_state(name),
        }
    }

    /// Attach to subscription `subscription` on `topic`, creating it if needed.
    ///
    /// Messages sent before a subscription exists are not delivered to it. Handles
    /// for the same subscription name compete for the same messages.
    pub fn subscribe(&self, topic: &str, subscription: &str) -> InMemorySubscription {
        let topic_state = self.topic_state(topic);
        let mut subs = match topic_state.subscriptions.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = subs
            .entry(subscription.to_string())
            .or_insert_with(|| {
                Arc::new(SubState {
                    name: format!("{}/{}", topic, subscription),
                    lease_timeout: self.inner.lease_timeout,
                    queue: Mutex::new(Queue::default()),
                    notify: Notify::new(),
                    closed: AtomicBool::new(self.inner.closed.load(Ordering::SeqCst)),
                })
            })
            .clone();

        InMemorySubscription { state }
    }

    /// Close every subscription; blocked receivers return `BrokerError::Closed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let topics = match self.inner.topics.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        for topic in topics.values() {
            if let Ok(subs) = topic.subscriptions.lock() {
                subs.values().for_each(|s| s.close());
            }
        }
    }
}

/// Send handle for an in-memory topic.
#[derive(Debug, Clone)]
pub struct InMemoryTopic {
    broker: InMemoryBroker,
    state: Arc<TopicState>,
}

#[async_trait]
impl Topic for InMemoryTopic {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn send(&self, body: Vec<u8>) -> Result<(), BrokerError> {
        if self.broker.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let id = self.broker.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let subs: Vec<Arc<SubState>> = self
            .state
            .subscriptions
            .lock()
            .map_err(|_| BrokerError::Command(format!("topic {} lock poisoned", self.state.name)))?
            .values()
            .cloned()
            .collect();

        for sub in subs {
            sub.lock()?.ready.push_back(Entry {
                id: id.clone(),
                body: body.clone(),
                attempt: 1,
            });
            sub.notify.notify_waiters();
        }

        Ok(())
    }
}

/// Receive handle for an in-memory subscription.
#[derive(Debug, Clone)]
pub struct InMemorySubscription {
    state: Arc<SubState>,
}

impl InMemorySubscription {
    /// Messages waiting for delivery (ready now or scheduled for redelivery).
    pub fn pending_count(&self) -> usize {
        self.state
            .lock()
            .map(|q| q.ready.len() + q.delayed.len())
            .unwrap_or(0)
    }

    /// Messages received but not yet settled.
    pub fn in_flight_count(&self) -> usize {
        self.state.lock().map(|q| q.in_flight.len()).unwrap_or(0)
    }

    pub fn acked_count(&self) -> u64 {
        self.state.lock().map(|q| q.acked).unwrap_or(0)
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state
            .lock()
            .map(|q| q.dead_letters.clone())
            .unwrap_or_default()
    }

    /// Nothing pending and nothing in flight.
    pub fn is_drained(&self) -> bool {
        self.pending_count() == 0 && self.in_flight_count() == 0
    }

    /// Close this subscription (all handles sharing it).
    pub fn close(&self) {
        self.state.close();
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn receive(&self) -> Result<Option<Message>, BrokerError> {
        loop {
            let mut notified = pin!(self.state.notify.notified());
            notified.as_mut().enable();

            if self.state.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }

            let wake = {
                let mut queue = self.state.lock()?;
                let now = Instant::now();
                queue.promote(now);

                if let Some(entry) = queue.ready.pop_front() {
                    let message = entry.to_message();
                    queue
                        .in_flight
                        .insert(entry.id.clone(), (now + self.state.lease_timeout, entry));
                    return Ok(Some(message));
                }
                queue.next_wake()
            };

            match wake {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn settle(&self, message: &Message, settlement: Settlement) -> Result<(), BrokerError> {
        let mut queue = self.state.lock()?;
        // A settle from a delivery whose lease already expired must not touch the
        // redelivery that replaced it.
        let current = queue
            .in_flight
            .get(&message.id)
            .is_some_and(|(_, entry)| entry.attempt == message.delivery_attempt);
        if !current {
            return Err(BrokerError::UnknownMessage(message.id.clone()));
        }
        let (_, mut entry) = queue
            .in_flight
            .remove(&message.id)
            .ok_or_else(|| BrokerError::UnknownMessage(message.id.clone()))?;

        match settlement {
            Settlement::Ack => queue.acked += 1,
            Settlement::DeadLetter { reason } => queue.dead_letters.push(DeadLetter {
                message: entry.to_message(),
                reason,
            }),
            Settlement::Nack { retry_after } => {
                entry.attempt += 1;
                if retry_after.is_zero() {
                    queue.ready.push_back(entry);
                } else {
                    queue.delayed.push((Instant::now() + retry_after, entry));
                }
            }
        }
        drop(queue);

        self.state.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv(sub: &InMemorySubscription) -> Message {
        sub.receive().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn every_subscription_gets_a_copy() {
        let broker = InMemoryBroker::new();
        let workers = broker.subscribe("jobs", "workers");
        let audit = broker.subscribe("jobs", "audit");

        broker.topic("jobs").send(b"one".to_vec()).await.unwrap();

        assert_eq!(recv(&workers).await.body, b"one");
        assert_eq!(recv(&audit).await.body, b"one");
    }

    #[tokio::test]
    async fn competing_consumers_split_messages() {
        let broker = InMemoryBroker::new();
        let a = broker.subscribe("jobs", "workers");
        let b = broker.subscribe("jobs", "workers");
        let topic = broker.topic("jobs");

        topic.send(b"1".to_vec()).await.unwrap();
        topic.send(b"2".to_vec()).await.unwrap();

        let first = recv(&a).await;
        let second = recv(&b).await;
        assert_ne!(first.id, second.id);
        assert_eq!(a.in_flight_count(), 2);
        assert_eq!(a.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn nack_redelivers_after_delay_with_next_attempt() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe("jobs", "workers");
        broker.topic("jobs").send(b"x".to_vec()).await.unwrap();

        let msg = recv(&sub).await;
        assert_eq!(msg.delivery_attempt, 1);

        let started = Instant::now();
        sub.settle(&msg, Settlement::Nack { retry_after: Duration::from_secs(2) })
            .await
            .unwrap();

        let again = recv(&sub).await;
        assert_eq!(again.id, msg.id);
        assert_eq!(again.delivery_attempt, 2);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn ack_and_dead_letter_remove_the_message() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe("jobs", "workers");
        let topic = broker.topic("jobs");
        topic.send(b"a".to_vec()).await.unwrap();
        topic.send(b"b".to_vec()).await.unwrap();

        let a = recv(&sub).await;
        let b = recv(&sub).await;
        sub.settle(&a, Settlement::Ack).await.unwrap();
        sub.settle(&b, Settlement::DeadLetter { reason: "bad".into() })
            .await
            .unwrap();

        assert!(sub.is_drained());
        assert_eq!(sub.acked_count(), 1);
        assert_eq!(sub.dead_letters()[0].reason, "bad");

        let twice = sub.settle(&a, Settlement::Ack).await;
        assert!(matches!(twice, Err(BrokerError::UnknownMessage(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_makes_message_visible_again() {
        let broker = InMemoryBroker::with_lease_timeout(Duration::from_secs(30));
        let sub = broker.subscribe("jobs", "workers");
        broker.topic("jobs").send(b"x".to_vec()).await.unwrap();

        let lost = recv(&sub).await;
        let again = recv(&sub).await;
        assert_eq!(again.id, lost.id);
        assert_eq!(again.delivery_attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn settle_from_an_expired_lease_is_rejected() {
        let broker = InMemoryBroker::with_lease_timeout(Duration::from_secs(1));
        let sub = broker.subscribe("jobs", "workers");
        broker.topic("jobs").send(b"x".to_vec()).await.unwrap();

        let stale = recv(&sub).await;
        let fresh = recv(&sub).await;
        assert_eq!(fresh.delivery_attempt, 2);

        let late = sub.settle(&stale, Settlement::Nack { retry_after: Duration::ZERO }).await;
        assert!(matches!(late, Err(BrokerError::UnknownMessage(_))));

        sub.settle(&fresh, Settlement::Ack).await.unwrap();
        assert_eq!(sub.acked_count(), 1);
        assert!(sub.is_drained());
    }

    #[tokio::test]
    async fn close_wakes_blocked_receivers() {
        let broker = InMemoryBroker::new();
        let sub = broker.subscribe("jobs", "workers");

        let waiting = tokio::spawn({
            let sub = sub.clone();
            async move { sub.receive().await }
        });
        tokio::task::yield_now().await;
        broker.close();

        assert!(matches!(waiting.await.unwrap(), Err(BrokerError::Closed)));
        assert!(matches!(
            broker.topic("jobs").send(b"late".to_vec()).await,
            Err(BrokerError::Closed)
        ));
    }
}
