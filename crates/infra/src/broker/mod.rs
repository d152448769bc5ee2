//! Broker adapters backed by external infrastructure.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBroker, RedisSubscription, RedisTopic};
