//! In-process registry of connected client channels.
//!
//! A WebSocket or SSE handler calls [`ClientHub::connect`] when a client attaches and
//! forwards whatever arrives on the returned receiver to its socket.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use jobflow_core::ClientId;
use jobflow_events::{JobEvent, Notifier, NotifyError};

const DEFAULT_BUFFER: usize = 64;

pub struct ClientHub {
    clients: RwLock<HashMap<ClientId, mpsc::Sender<JobEvent>>>,
    buffer: usize,
}

impl ClientHub {
    pub fn new() -> Self {
        Self::with_buffer(DEFAULT_BUFFER)
    }

    /// Hub whose per-client channels hold up to `buffer` undelivered events.
    pub fn with_buffer(buffer: usize) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register `client_id`, replacing any previous channel for it.
    pub async fn connect(&self, client_id: impl Into<ClientId>) -> mpsc::Receiver<JobEvent> {
        let client_id = client_id.into();
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.clients.write().await.insert(client_id.clone(), tx).is_some() {
            debug!(client_id = %client_id, "replaced existing client channel");
        }
        info!(client_id = %client_id, "client connected");
        rx
    }

    pub async fn disconnect(&self, client_id: &ClientId) {
        if self.clients.write().await.remove(client_id).is_some() {
            info!(client_id = %client_id, "client disconnected");
        }
    }

    pub async fn connected_count(&self) -> usize {
        self.clients.read().await.len()
    }
}

impl Default for ClientHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for ClientHub {
    async fn push(&self, client_id: &ClientId, event: &JobEvent) -> Result<(), NotifyError> {
        let sent = {
            let clients = self.clients.read().await;
            let sender = clients
                .get(client_id)
                .ok_or_else(|| NotifyError::NotConnected(client_id.clone()))?;
            sender.try_send(event.clone())
        };

        match sent {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(NotifyError::Backpressure(client_id.clone()))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                // Receiver dropped without a disconnect.
                self.disconnect(client_id).await;
                Err(NotifyError::NotConnected(client_id.clone()))
            }
        }
    }
}
