use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{BroadcasterError, Result};
use crate::events::ServerEvent;

/// Opaque per-connection identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps log lines readable
        let id = self.0.simple().to_string();
        f.write_str(&id[..8])
    }
}

/// Outbound half of a connection: frames are handed to the connection's
/// writer task through an unbounded channel so a slow socket never blocks
/// dispatch for other clients.
pub struct Client {
    id: ClientId,
    sender: mpsc::UnboundedSender<String>,
    connected_at: DateTime<Utc>,
    last_activity: Instant,
}

impl Client {
    pub fn new(sender: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: ClientId::new(),
            sender,
            connected_at: Utc::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Queue an event for this client
    pub fn send_event(&self, event: &ServerEvent) -> Result<()> {
        let message = event.to_message()?;
        self.sender
            .send(message)
            .map_err(|_| BroadcasterError::Disconnected(self.id))
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

/// Summary used by `/health` and `/status`
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientInfo {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub idle_secs: f64,
}

/// Thread-safe client registry
pub struct ClientManager {
    clients: Arc<Mutex<HashMap<ClientId, Client>>>,
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Add new client
    pub async fn add_client(&self, client: Client) -> ClientId {
        let id = client.id();
        let mut clients = self.clients.lock().await;
        clients.insert(id, client);
        tracing::info!("Client {} connected. Total clients: {}", id, clients.len());
        id
    }

    pub async fn remove_client(&self, id: ClientId) -> bool {
        let mut clients = self.clients.lock().await;
        let removed = clients.remove(&id).is_some();
        if removed {
            tracing::info!("Client {} removed. Remaining: {}", id, clients.len());
        }
        removed
    }

    /// Refresh a client's activity timestamp
    pub async fn touch(&self, id: ClientId) {
        if let Some(client) = self.clients.lock().await.get_mut(&id) {
            client.last_activity = Instant::now();
        }
    }

    /// Deliver an event to exactly one client
    pub async fn send_to(&self, id: ClientId, event: &ServerEvent) -> Result<()> {
        let clients = self.clients.lock().await;
        let client = clients
            .get(&id)
            .ok_or(BroadcasterError::UnknownClient(id))?;
        client.send_event(event)
    }

    /// Broadcast event to all clients, removing dead ones.
    ///
    /// Returns the number of clients the event was queued for.
    pub async fn broadcast(&self, event: &ServerEvent) -> Result<usize> {
        let message = event.to_message()?;
        let mut clients = self.clients.lock().await;

        let dead: Vec<ClientId> = clients
            .values()
            .filter(|client| client.sender.send(message.clone()).is_err())
            .map(Client::id)
            .collect();

        for id in &dead {
            clients.remove(id);
            tracing::info!("Removed dead client {}. Remaining: {}", id, clients.len());
        }

        Ok(clients.len())
    }

    /// Clients with no activity for longer than `timeout`
    pub async fn stale_clients(&self, timeout: Duration) -> Vec<ClientId> {
        self.clients
            .lock()
            .await
            .values()
            .filter(|client| client.idle_for() > timeout)
            .map(Client::id)
            .collect()
    }

    pub async fn client_info(&self) -> Vec<ClientInfo> {
        self.clients
            .lock()
            .await
            .values()
            .map(|client| ClientInfo {
                id: client.id.to_string(),
                connected_at: client.connected_at,
                idle_secs: client.idle_for().as_secs_f64(),
            })
            .collect()
    }

    /// Get current client count
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
