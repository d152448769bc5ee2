//! Long-running consumers.

pub mod dispatcher;
pub mod job_worker;
pub mod pool;

pub use dispatcher::NotificationDispatcher;
pub use job_worker::Worker;
pub use pool::{ConsumerPool, DeliveryHandler, PoolStats};
