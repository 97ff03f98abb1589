//! Server-initiated pushes to live client connections.

use std::collections::HashMap;

use async_trait::async_trait;
use chorus_core::protocol::ServerFrame;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

#[derive(Error, Debug)]
pub enum DeliveryError {
    /// The connection no longer exists on this server.
    #[error("Connection gone: {0}")]
    Gone(String),

    #[error("Delivery failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait Delivery: Send + Sync {
    async fn post_to_connection(
        &self,
        connection_id: &str,
        frame: &ServerFrame,
    ) -> Result<(), DeliveryError>;
}

/// Registry of open sockets on this process, keyed by connection id.
/// Each socket task owns the receiving half and writes frames out.
#[derive(Default)]
pub struct ConnectionHub {
    senders: RwLock<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, connection_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders
            .write()
            .await
            .insert(connection_id.to_string(), tx);
        rx
    }

    pub async fn unregister(&self, connection_id: &str) {
        self.senders.write().await.remove(connection_id);
    }

    pub async fn len(&self) -> usize {
        self.senders.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl Delivery for ConnectionHub {
    async fn post_to_connection(
        &self,
        connection_id: &str,
        frame: &ServerFrame,
    ) -> Result<(), DeliveryError> {
        let senders = self.senders.read().await;
        let tx = senders
            .get(connection_id)
            .ok_or_else(|| DeliveryError::Gone(connection_id.to_string()))?;
        tx.send(frame.to_json())
            .map_err(|_| DeliveryError::Gone(connection_id.to_string()))
    }
}
