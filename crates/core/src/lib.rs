//! `jobflow-core`: shared building blocks for the job pipeline.
//!
//! This crate contains identifiers and the error taxonomy (no IO, no async).

pub mod error;
pub mod id;

pub use error::{ErrorKind, IdError, JobError};
pub use id::{ClientId, JobId};
