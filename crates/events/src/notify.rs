//! Client-facing fan-out seams: who gets an event, and how it reaches them.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use jobflow_core::{ClientId, JobId};

use crate::event::JobEvent;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("client {0} is not connected")]
    NotConnected(ClientId),

    #[error("client {0} is not keeping up; notification dropped")]
    Backpressure(ClientId),

    #[error("notification transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("client lookup failed: {0}")]
    Lookup(String),
}

/// Real-time delivery of events to a client (WebSocket hub, SSE, webhook relay...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn push(&self, client_id: &ClientId, event: &JobEvent) -> Result<(), NotifyError>;
}

/// Maps a job back to the client/session that submitted it.
#[async_trait]
pub trait ClientResolver: Send + Sync {
    /// `Ok(None)` when nobody is waiting for this job.
    async fn resolve(&self, job_id: &JobId) -> Result<Option<ClientId>, ResolveError>;
}

/// In-memory job → client map (tests/dev, or when submission happens in-process).
#[derive(Debug, Default)]
pub struct InMemoryClientResolver {
    clients: RwLock<HashMap<JobId, ClientId>>,
}

impl InMemoryClientResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, job_id: impl Into<JobId>, client_id: impl Into<ClientId>) {
        if let Ok(mut clients) = self.clients.write() {
            clients.insert(job_id.into(), client_id.into());
        }
    }

    pub fn remove(&self, job_id: &JobId) -> Option<ClientId> {
        self.clients.write().ok()?.remove(job_id)
    }
}

#[async_trait]
impl ClientResolver for InMemoryClientResolver {
    async fn resolve(&self, job_id: &JobId) -> Result<Option<ClientId>, ResolveError> {
        let clients = self
            .clients
            .read()
            .map_err(|_| ResolveError::Lookup("client map lock poisoned".into()))?;
        Ok(clients.get(job_id).cloned())
    }
}
