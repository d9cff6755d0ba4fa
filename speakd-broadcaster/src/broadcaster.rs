use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::client::{Client, ClientId, ClientInfo, ClientManager};
use crate::events::ServerEvent;
use crate::throttle::LogThrottle;

/// Event fan-out for connected clients.
///
/// Targeted replies go through [`Broadcaster::send`]; daemon-wide events
/// through [`Broadcaster::broadcast`]. Delivery failures are logged, never
/// propagated into session logic.
pub struct Broadcaster {
    client_manager: ClientManager,
    heartbeat_log: Mutex<LogThrottle>,
}

impl Broadcaster {
    pub fn new(heartbeat_log_interval: Duration) -> Self {
        Self {
            client_manager: ClientManager::new(),
            heartbeat_log: Mutex::new(LogThrottle::new(heartbeat_log_interval)),
        }
    }

    /// Register a connection; the receiver yields its outbound text frames
    pub async fn connect(&self) -> (ClientId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.client_manager.add_client(Client::new(tx)).await;
        (id, rx)
    }

    pub async fn disconnect(&self, id: ClientId) -> bool {
        self.client_manager.remove_client(id).await
    }

    /// Send an event to one client
    pub async fn send(&self, id: ClientId, event: &ServerEvent) -> bool {
        match self.client_manager.send_to(id, event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Dropping {} for client {}: {}", event.kind(), id, e);
                false
            }
        }
    }

    /// Send an event to every client
    pub async fn broadcast(&self, event: &ServerEvent) -> usize {
        match self.client_manager.broadcast(event).await {
            Ok(delivered) => delivered,
            Err(e) => {
                tracing::error!("Failed to broadcast {}: {}", event.kind(), e);
                0
            }
        }
    }

    pub async fn touch(&self, id: ClientId) {
        self.client_manager.touch(id).await;
    }

    /// Record a client heartbeat, logging at most once per throttle window
    pub async fn heartbeat(&self, id: ClientId) {
        self.touch(id).await;
        if let Some(suppressed) = self.heartbeat_log.lock().await.check() {
            if suppressed > 0 {
                tracing::debug!(
                    "Heartbeat from client {} ({} more since last report)",
                    id,
                    suppressed
                );
            } else {
                tracing::debug!("Heartbeat from client {}", id);
            }
        }
    }

    pub async fn stale_clients(&self, timeout: Duration) -> Vec<ClientId> {
        self.client_manager.stale_clients(timeout).await
    }

    pub async fn client_info(&self) -> Vec<ClientInfo> {
        self.client_manager.client_info().await
    }

    /// Get current client count
    pub async fn client_count(&self) -> usize {
        self.client_manager.client_count().await
    }
}
