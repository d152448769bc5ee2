//! Bounded consumer pool over one subscription.
//!
//! Pulls messages while a concurrency permit is free, runs a [`DeliveryHandler`] per
//! message on its own task and applies the settlement the handler returns. Each received
//! message is settled at most once; a message whose handler never finishes (aborted at
//! shutdown) stays unsettled and the broker redelivers it.
//!
//! Shutdown: once `cancel` fires the pool stops pulling, waits up to `shutdown_grace`
//! for in-flight handlers, then cancels their token and aborts whatever is left.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use jobflow_events::{BrokerError, Message, Settlement, Subscription};

/// Back-off after a transient receive error.
const RECEIVE_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Per-message work run by a [`ConsumerPool`].
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Process `message` and decide how it is settled.
    ///
    /// `cancel` fires when the shutdown grace period runs out.
    async fn handle(&self, message: &Message, cancel: &CancellationToken) -> Settlement;
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub received: u64,
    pub acked: u64,
    pub dead_lettered: u64,
    pub nacked: u64,
    pub settle_failures: u64,
    /// Handlers still running when the grace period ran out.
    pub aborted: u64,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    acked: AtomicU64,
    dead_lettered: AtomicU64,
    nacked: AtomicU64,
    settle_failures: AtomicU64,
    aborted: AtomicU64,
}

impl Counters {
    fn record(&self, settlement: &Settlement) {
        let counter = match settlement {
            Settlement::Ack => &self.acked,
            Settlement::DeadLetter { .. } => &self.dead_lettered,
            Settlement::Nack { .. } => &self.nacked,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            received: self.received.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            nacked: self.nacked.load(Ordering::Relaxed),
            settle_failures: self.settle_failures.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
        }
    }
}

pub struct ConsumerPool {
    name: String,
    subscription: Arc<dyn Subscription>,
    handler: Arc<dyn DeliveryHandler>,
    concurrency: usize,
    shutdown_grace: Duration,
}

impl ConsumerPool {
    pub fn new(
        name: impl Into<String>,
        subscription: Arc<dyn Subscription>,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            subscription,
            handler,
            concurrency: 10,
            shutdown_grace: Duration::from_secs(10),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Consume until `cancel` fires, the subscription closes, or the broker fails
    /// with a non-transient error. In-flight handlers are drained in every case.
    pub async fn run(&self, cancel: CancellationToken) -> Result<PoolStats, BrokerError> {
        info!(
            pool = %self.name,
            subscription = %self.subscription.name(),
            concurrency = self.concurrency,
            "consumer pool started"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let handler_cancel = CancellationToken::new();
        let counters = Arc::new(Counters::default());
        let mut tasks: JoinSet<()> = JoinSet::new();

        let outcome = loop {
            while let Some(joined) = tasks.try_join_next() {
                self.log_join(joined);
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                received = self.subscription.receive() => received,
            };

            let message = match received {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(BrokerError::Closed) => {
                    info!(pool = %self.name, "subscription closed");
                    break Ok(());
                }
                Err(err) if err.is_transient() => {
                    warn!(pool = %self.name, error = %err, "receive failed; backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => break Ok(()),
                        _ = tokio::time::sleep(RECEIVE_ERROR_BACKOFF) => continue,
                    }
                }
                Err(err) => {
                    error!(pool = %self.name, error = %err, "unrecoverable broker error");
                    break Err(err);
                }
            };

            counters.received.fetch_add(1, Ordering::Relaxed);
            debug!(
                pool = %self.name,
                message_id = %message.id,
                delivery_attempt = message.delivery_attempt,
                "received message"
            );

            let subscription = self.subscription.clone();
            let handler = self.handler.clone();
            let counters = counters.clone();
            let handler_cancel = handler_cancel.clone();
            let pool = self.name.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let settlement = handler.handle(&message, &handler_cancel).await;
                let label = settlement.label();

                match subscription.settle(&message, settlement.clone()).await {
                    Ok(()) => counters.record(&settlement),
                    Err(err) => {
                        counters.settle_failures.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            pool = %pool,
                            message_id = %message.id,
                            settlement = label,
                            error = %err,
                            "settlement failed; message will be redelivered"
                        );
                    }
                }
            });
        };

        self.drain(&mut tasks, &handler_cancel, &counters).await;

        let stats = counters.snapshot();
        info!(pool = %self.name, ?stats, "consumer pool stopped");
        outcome.map(|()| stats)
    }

    async fn drain(
        &self,
        tasks: &mut JoinSet<()>,
        handler_cancel: &CancellationToken,
        counters: &Counters,
    ) {
        if tasks.is_empty() {
            return;
        }

        info!(pool = %self.name, in_flight = tasks.len(), "draining in-flight handlers");
        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                self.log_join(joined);
            }
        })
        .await;

        if drained.is_err() {
            let remaining = tasks.len() as u64;
            warn!(
                pool = %self.name,
                remaining,
                "shutdown grace period elapsed; aborting in-flight handlers"
            );
            counters.aborted.fetch_add(remaining, Ordering::Relaxed);
            handler_cancel.cancel();
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }

    fn log_join(&self, joined: Result<(), tokio::task::JoinError>) {
        if let Err(err) = joined {
            if err.is_panic() {
                error!(pool = %self.name, error = %err, "handler task panicked");
            }
        }
    }
}

impl std::fmt::Debug for ConsumerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPool")
            .field("name", &self.name)
            .field("subscription", &self.subscription.name())
            .field("concurrency", &self.concurrency)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish()
    }
}
