//! Process wiring: one binary that runs either the job worker or the notification
//! dispatcher against Redis Streams.

pub mod app;
pub mod config;
pub mod processors;

pub use app::{run, shutdown_signal};
pub use config::{Role, ServiceConfig};
