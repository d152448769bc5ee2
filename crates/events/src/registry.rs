//! Job type → processor lookup table.
//!
//! Built once at startup, then shared read-only (behind `Arc`) by every worker task.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::processor::Processor;

/// A registered processor plus its per-type settings.
#[derive(Clone)]
pub struct Registration {
    processor: Arc<dyn Processor>,
    timeout: Option<Duration>,
}

impl Registration {
    pub fn processor(&self) -> &Arc<dyn Processor> {
        &self.processor
    }

    /// Per-type processing timeout, when one was configured.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

impl core::fmt::Debug for Registration {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Registration")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("processor already registered for job type '{0}'")]
    Duplicate(String),
}

#[derive(Debug, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<String, Registration>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for `job_type`.
    ///
    /// # Panics
    ///
    /// Panics when `job_type` is already registered. Duplicate registration is a
    /// startup configuration error.
    pub fn register<P>(&mut self, job_type: impl Into<String>, processor: P) -> &mut Self
    where
        P: Processor + 'static,
    {
        if let Err(err) = self.try_register(job_type, Arc::new(processor), None) {
            panic!("{err}");
        }
        self
    }

    /// Like [`register`](Self::register), with a processing timeout for this job type.
    ///
    /// # Panics
    ///
    /// Panics when `job_type` is already registered.
    pub fn register_with_timeout<P>(
        &mut self,
        job_type: impl Into<String>,
        processor: P,
        timeout: Duration,
    ) -> &mut Self
    where
        P: Processor + 'static,
    {
        if let Err(err) = self.try_register(job_type, Arc::new(processor), Some(timeout)) {
            panic!("{err}");
        }
        self
    }

    pub fn try_register(
        &mut self,
        job_type: impl Into<String>,
        processor: Arc<dyn Processor>,
        timeout: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let job_type = job_type.into();
        if self.processors.contains_key(&job_type) {
            return Err(RegistryError::Duplicate(job_type));
        }
        debug!(job_type = %job_type, ?timeout, "registered processor");
        self.processors
            .insert(job_type, Registration { processor, timeout });
        Ok(())
    }

    /// Look up the processor for `job_type`. Absence is the caller's problem.
    pub fn lookup(&self, job_type: &str) -> Option<&Registration> {
        self.processors.get(job_type)
    }

    pub fn job_types(&self) -> impl Iterator<Item = &str> {
        self.processors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}
