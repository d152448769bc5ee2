//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Topic**: one stream per topic name; `XADD` appends `body` + `content_type`
//! - **Subscription**: one consumer group per subscription name; consumers inside the
//!   group compete (`XREADGROUP >`)
//! - **Ack**: `XACK`
//! - **Dead letter**: `XADD {topic}:dlq` with the original id, reason, timestamp and
//!   body, then `XACK` (one `MULTI`)
//! - **Nack**: the entry stays pending; its id is scheduled in the sorted set
//!   `{topic}:{group}:retry` (score = due time in ms) and re-claimed when due
//! - **Lease expiry**: pending entries idle longer than the lease and not scheduled for
//!   retry are `XCLAIM`ed by whichever consumer polls next
//!
//! Delivery attempts are Redis's own per-entry delivery counter (`XPENDING`), so they
//! survive consumer restarts.
//!
//! Writes and acks share one multiplexed connection; every subscription opens its own
//! connection for the blocking `XREADGROUP`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tracing::{debug, info, instrument, warn};

use jobflow_events::{BrokerError, JSON_CONTENT_TYPE, Message, Settlement, Subscription, Topic};

const BODY_FIELD: &str = "body";
const CONTENT_TYPE_FIELD: &str = "content_type";

const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Abandoned entries inspected per poll.
const RECLAIM_SCAN: usize = 10;

fn broker_error(context: &str, err: redis::RedisError) -> BrokerError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        BrokerError::Connection(format!("{context}: {err}"))
    } else {
        BrokerError::Command(format!("{context} failed: {err}"))
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Clone)]
pub struct RedisStreamsBroker {
    client: redis::Client,
    conn: MultiplexedConnection,
    lease_timeout: Duration,
    block_timeout: Duration,
}

impl RedisStreamsBroker {
    /// Connect to `redis_url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| broker_error("connect", e))?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("PING", e))?;

        info!(redis_url = %redis_url, "connected to redis");
        Ok(Self {
            client,
            conn,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        })
    }

    /// How long a received entry may stay unsettled before another consumer claims it.
    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Upper bound on one blocking read (`receive` returns `Ok(None)` after it).
    pub fn with_block_timeout(mut self, block_timeout: Duration) -> Self {
        self.block_timeout = block_timeout;
        self
    }

    /// Shared connection for collaborators that live next to the broker.
    pub fn connection(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    pub fn topic(&self, name: &str) -> RedisTopic {
        RedisTopic {
            conn: self.conn.clone(),
            stream_key: name.to_string(),
        }
    }

    /// Join consumer group `group` on `topic` as `consumer`, creating the group (and the
    /// stream) when missing.
    #[instrument(skip(self), err)]
    pub async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
    ) -> Result<RedisSubscription, BrokerError> {
        let mut conn = self.conn.clone();

        // "0": a new group starts with whatever the stream already holds.
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(topic)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => info!(stream = %topic, group = %group, "created consumer group"),
            Err(e) if e.code() == Some("BUSYGROUP") => {
                debug!(stream = %topic, group = %group, "consumer group exists")
            }
            Err(e) => return Err(broker_error("XGROUP CREATE", e)),
        }

        let read_conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| broker_error("connect", e))?;

        Ok(RedisSubscription {
            conn,
            read_conn,
            stream_key: topic.to_string(),
            dlq_key: format!("{topic}:dlq"),
            retry_key: format!("{topic}:{group}:retry"),
            group: group.to_string(),
            consumer: consumer.to_string(),
            lease_timeout: self.lease_timeout,
            block_timeout: self.block_timeout,
        })
    }
}

impl std::fmt::Debug for RedisStreamsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsBroker")
            .field("lease_timeout", &self.lease_timeout)
            .field("block_timeout", &self.block_timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct RedisTopic {
    conn: MultiplexedConnection,
    stream_key: String,
}

#[async_trait]
impl Topic for RedisTopic {
    fn name(&self) -> &str {
        &self.stream_key
    }

    #[instrument(skip(self, body), fields(stream = %self.stream_key, bytes = body.len()), err)]
    async fn send(&self, body: Vec<u8>) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&self.stream_key)
            .arg("*")
            .arg(BODY_FIELD)
            .arg(body)
            .arg(CONTENT_TYPE_FIELD)
            .arg(JSON_CONTENT_TYPE)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XADD", e))?;
        Ok(())
    }
}

pub struct RedisSubscription {
    conn: MultiplexedConnection,
    read_conn: MultiplexedConnection,
    stream_key: String,
    dlq_key: String,
    retry_key: String,
    group: String,
    consumer: String,
    lease_timeout: Duration,
    block_timeout: Duration,
}

impl RedisSubscription {
    /// Claim one nacked entry whose retry time has come.
    async fn claim_due_retry(&self) -> Result<Option<Message>, BrokerError> {
        let mut conn = self.conn.clone();
        let due: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.retry_key)
            .arg("-inf")
            .arg(now_ms())
            .arg("LIMIT")
            .arg(0)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("ZRANGEBYSCORE", e))?;

        for id in due {
            // Whoever removes the schedule entry owns the redelivery.
            let removed: u64 = redis::cmd("ZREM")
                .arg(&self.retry_key)
                .arg(&id)
                .query_async(&mut conn)
                .await
                .map_err(|e| broker_error("ZREM", e))?;
            if removed == 0 {
                continue;
            }
            if let Some(message) = self.claim(&id, 0).await? {
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// Claim one entry abandoned by a consumer that never settled it.
    async fn claim_abandoned(&self) -> Result<Option<Message>, BrokerError> {
        let mut conn = self.conn.clone();
        let lease_ms = self.lease_timeout.as_millis() as u64;
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg("IDLE")
            .arg(lease_ms)
            .arg("-")
            .arg("+")
            .arg(RECLAIM_SCAN)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XPENDING", e))?;

        for entry in pending.ids {
            let scheduled: Option<f64> = redis::cmd("ZSCORE")
                .arg(&self.retry_key)
                .arg(&entry.id)
                .query_async(&mut conn)
                .await
                .map_err(|e| broker_error("ZSCORE", e))?;
            if scheduled.is_some() {
                continue;
            }
            if let Some(message) = self.claim(&entry.id, lease_ms).await? {
                warn!(
                    stream = %self.stream_key,
                    group = %self.group,
                    message_id = %entry.id,
                    previous_consumer = %entry.consumer,
                    "claimed abandoned message"
                );
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    /// `XCLAIM` one entry for this consumer; `None` when it was claimed elsewhere or
    /// deleted from the stream.
    async fn claim(&self, id: &str, min_idle_ms: u64) -> Result<Option<Message>, BrokerError> {
        let mut conn = self.conn.clone();
        let claimed: StreamClaimReply = redis::cmd("XCLAIM")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(&self.consumer)
            .arg(min_idle_ms)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XCLAIM", e))?;

        match claimed.ids.into_iter().next() {
            Some(entry) => {
                let attempt = self.delivery_count(&entry.id).await?;
                Ok(Some(to_message(entry, attempt)))
            }
            None => Ok(None),
        }
    }

    async fn delivery_count(&self, id: &str) -> Result<u32, BrokerError> {
        let mut conn = self.conn.clone();
        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream_key)
            .arg(&self.group)
            .arg(id)
            .arg(id)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XPENDING", e))?;

        Ok(pending
            .ids
            .first()
            .map(|p| p.times_delivered.clamp(1, u32::MAX as usize) as u32)
            .unwrap_or(1))
    }

    async fn read_new(&self) -> Result<Option<Message>, BrokerError> {
        let mut conn = self.read_conn.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.block_timeout.as_millis() as u64)
            .arg("STREAMS")
            .arg(&self.stream_key)
            .arg(">")
            .query_async(&mut conn)
            .await
            .map_err(|e| broker_error("XREADGROUP", e))?;

        Ok(reply
            .and_then(|r| r.keys.into_iter().next())
            .and_then(|k| k.ids.into_iter().next())
            .map(|entry| to_message(entry, 1)))
    }
}

fn to_message(entry: StreamId, delivery_attempt: u32) -> Message {
    let body: Vec<u8> = entry.get(BODY_FIELD).unwrap_or_default();
    let content_type: Option<String> = entry.get(CONTENT_TYPE_FIELD);
    let mut message = Message::new(entry.id, body, delivery_attempt);
    if let Some(content_type) = content_type {
        message.content_type = content_type;
    }
    message
}

#[async_trait]
impl Subscription for RedisSubscription {
    fn name(&self) -> &str {
        &self.group
    }

    #[instrument(skip(self), fields(stream = %self.stream_key, group = %self.group), err)]
    async fn receive(&self) -> Result<Option<Message>, BrokerError> {
        if let Some(message) = self.claim_due_retry().await? {
            return Ok(Some(message));
        }
        if let Some(message) = self.claim_abandoned().await? {
            return Ok(Some(message));
        }
        self.read_new().await
    }

    #[instrument(
        skip(self, message, settlement),
        fields(stream = %self.stream_key, group = %self.group, message_id = %message.id, settlement = settlement.label()),
        err
    )]
    async fn settle(&self, message: &Message, settlement: Settlement) -> Result<(), BrokerError> {
        let mut conn = self.conn.clone();
        match settlement {
            Settlement::Ack => {
                let _: u64 = redis::cmd("XACK")
                    .arg(&self.stream_key)
                    .arg(&self.group)
                    .arg(&message.id)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| broker_error("XACK", e))?;
            }
            Settlement::DeadLetter { reason } => {
                let _: () = redis::pipe()
                    .atomic()
                    .cmd("XADD")
                    .arg(&self.dlq_key)
                    .arg("*")
                    .arg("original_message_id")
                    .arg(&message.id)
                    .arg("group")
                    .arg(&self.group)
                    .arg("reason")
                    .arg(&reason)
                    .arg("delivery_attempt")
                    .arg(message.delivery_attempt)
                    .arg("failed_at")
                    .arg(chrono::Utc::now().to_rfc3339())
                    .arg(BODY_FIELD)
                    .arg(message.body.as_slice())
                    .ignore()
                    .cmd("XACK")
                    .arg(&self.stream_key)
                    .arg(&self.group)
                    .arg(&message.id)
                    .ignore()
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| broker_error("dead-letter", e))?;

                warn!(
                    stream = %self.stream_key,
                    message_id = %message.id,
                    reason = %reason,
                    "message sent to dead-letter stream"
                );
            }
            Settlement::Nack { retry_after } => {
                let due = now_ms() + retry_after.as_millis() as i64;
                let _: u64 = redis::cmd("ZADD")
                    .arg(&self.retry_key)
                    .arg(due)
                    .arg(&message.id)
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| broker_error("ZADD", e))?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RedisSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubscription")
            .field("stream", &self.stream_key)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_failures_are_classified_as_connection_errors() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert!(matches!(broker_error("XADD", io), BrokerError::Connection(_)));

        let cmd = redis::RedisError::from((redis::ErrorKind::ResponseError, "WRONGTYPE"));
        let err = broker_error("XADD", cmd);
        assert!(matches!(err, BrokerError::Command(ref msg) if msg.starts_with("XADD failed")));
        assert!(err.is_transient());
    }

    #[test]
    fn stream_entries_become_messages() {
        let mut entry = StreamId::default();
        entry.id = "1700000000000-0".to_string();
        entry.map.insert(
            BODY_FIELD.to_string(),
            redis::Value::Data(br#"{"jobId":"j1"}"#.to_vec()),
        );

        let message = to_message(entry, 3);
        assert_eq!(message.id, "1700000000000-0");
        assert_eq!(message.body, br#"{"jobId":"j1"}"#.to_vec());
        assert_eq!(message.content_type, JSON_CONTENT_TYPE);
        assert_eq!(message.delivery_attempt, 3);
    }
}
