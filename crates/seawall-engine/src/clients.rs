//! Client registry and the event bridge to pages.
//!
//! Pages register to receive engine notices over an unbounded channel,
//! the in-process stand-in for a worker `postMessage`. Control flows the
//! other way as [`ControlMessage`] values.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace, warn};
use url::Url;

use seawall_common::now_millis;
use seawall_fetch::ClientId;

/// Notice pushed from the engine to pages.
///
/// Serialized with a SCREAMING_SNAKE `type` tag, the shape page scripts
/// expect from a worker message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    /// The origin stopped answering.
    ServerUnreachable { url: String, timestamp: u64 },
    /// A new cache generation took over.
    CacheVersionActivated { version: String, timestamp: u64 },
}

/// Message posted by a page to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    /// Ask a waiting installation to activate now.
    SkipWaiting,
}

struct ClientEntry {
    url: Url,
    sender: mpsc::UnboundedSender<ClientMessage>,
    controlled: bool,
}

/// Registry of live pages and whether this engine controls them.
pub struct ClientRegistry {
    clients: RwLock<HashMap<ClientId, ClientEntry>>,
    /// Control new registrations immediately instead of waiting for
    /// their first navigation.
    control_on_register: bool,
}

impl ClientRegistry {
    pub fn new(control_on_register: bool) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            control_on_register,
        }
    }

    /// Register a page; returns its id and the notice stream.
    pub async fn register(&self, url: Url) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId::new();
        debug!(client = id.raw(), url = %url, "Client registered");
        self.clients.write().await.insert(
            id,
            ClientEntry {
                url,
                sender: tx,
                controlled: self.control_on_register,
            },
        );
        (id, rx)
    }

    pub async fn unregister(&self, id: ClientId) -> bool {
        let removed = self.clients.write().await.remove(&id).is_some();
        if removed {
            debug!(client = id.raw(), "Client unregistered");
        }
        removed
    }

    /// Whether the engine controls this client. Unknown ids count as
    /// controlled so requests from short-lived pages are still served.
    pub async fn is_controlled(&self, id: ClientId) -> bool {
        self.clients
            .read()
            .await
            .get(&id)
            .map_or(true, |entry| entry.controlled)
    }

    /// Take control of one client; its next responses come from the
    /// engine.
    pub async fn adopt(&self, id: ClientId) {
        if let Some(entry) = self.clients.write().await.get_mut(&id) {
            if !entry.controlled {
                entry.controlled = true;
                debug!(client = id.raw(), url = %entry.url, "Client adopted");
            }
        }
    }

    /// Take control of every registered client.
    pub async fn adopt_all(&self) {
        let mut clients = self.clients.write().await;
        for (id, entry) in clients.iter_mut() {
            if !entry.controlled {
                entry.controlled = true;
                trace!(client = id.raw(), "Client adopted");
            }
        }
    }

    /// Send to every controlled client. Disconnected clients are
    /// dropped from the registry.
    pub async fn broadcast(&self, message: ClientMessage) {
        self.clients.write().await.retain(|id, entry| {
            if !entry.controlled {
                return true;
            }
            let alive = entry.sender.send(message.clone()).is_ok();
            if !alive {
                trace!(client = id.raw(), "Dropping disconnected client");
            }
            alive
        });
    }

    /// Send to every client, controlled or not.
    pub async fn broadcast_all(&self, message: ClientMessage) {
        self.clients.write().await.retain(|id, entry| {
            let alive = entry.sender.send(message.clone()).is_ok();
            if !alive {
                trace!(client = id.raw(), "Dropping disconnected client");
            }
            alive
        });
    }

    /// Tell controlled pages the origin stopped answering. Sent once per
    /// failed origin fetch.
    pub async fn notify_unreachable(&self, url: &Url) {
        warn!(url = %url, "Origin unreachable, notifying clients");
        self.broadcast(ClientMessage::ServerUnreachable {
            url: url.to_string(),
            timestamp: now_millis(),
        })
        .await;
    }

    /// Announce an activated generation to every page, including ones
    /// the engine does not control yet.
    pub async fn notify_activated(&self, version: &str) {
        self.broadcast_all(ClientMessage::CacheVersionActivated {
            version: version.to_string(),
            timestamp: now_millis(),
        })
        .await;
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn controlled_count(&self) -> usize {
        self.clients
            .read()
            .await
            .values()
            .filter(|entry| entry.controlled)
            .count()
    }
}
