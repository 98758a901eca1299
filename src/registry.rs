//! Connection registry.
//!
//! Tracks which identifiers are online and how to reach them. This is the
//! only shared mutable state in the relay. Every operation is a single
//! DashMap call, so each one is atomic on its own, and handles are cloned out
//! before anything is sent so no shard lock is held while a peer is written to.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::names::NameSource;
use crate::protocol::ServerMessage;

/// Upper bound on identifier candidates tried for one connection.
const MAX_ALLOCATION_ATTEMPTS: usize = 64;

/// Distinguishes two connections that held the same identifier over time.
pub type ConnectionId = Uuid;

/// Work for a connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    /// Close the socket; the connection has been evicted.
    #[allow(dead_code)]
    Close,
}

/// Outbound handle to one connected participant.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    connection: ConnectionId,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl PeerHandle {
    pub fn new(sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            connection: Uuid::new_v4(),
            sender,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Queue a message for the writer task. Returns false if the connection is gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.sender.send(Outbound::Message(message)).is_ok()
    }

    /// Ask the writer task to close the socket.
    #[allow(dead_code)]
    pub fn close(&self) {
        let _ = self.sender.send(Outbound::Close);
    }
}

/// Identifier → participant mapping.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    peers: Arc<DashMap<String, PeerHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `handle` under `id`. A participant already holding `id` is
    /// evicted and its connection closed (last writer wins).
    #[allow(dead_code)]
    pub fn register(&self, id: &str, handle: PeerHandle) {
        let connection = handle.connection();
        let evicted = self.peers.insert(id.to_string(), handle);

        if let Some(previous) = evicted {
            tracing::warn!(
                id = id,
                evicted = %previous.connection(),
                connection = %connection,
                "Identifier already registered, closing previous connection"
            );
            previous.close();
        } else {
            tracing::info!(id = id, connection = %connection, "Client registered");
        }
    }

    /// Allocate an identifier that no live participant holds and install
    /// `handle` under it. Candidates come from `names`; occupied ones are
    /// skipped, never evicted.
    pub fn register_unique(&self, names: &dyn NameSource, handle: PeerHandle) -> Result<String> {
        for attempt in 0..MAX_ALLOCATION_ATTEMPTS {
            match self.peers.entry(names.candidate(attempt)) {
                Entry::Vacant(slot) => {
                    let id = slot.key().clone();
                    let connection = handle.connection();
                    slot.insert(handle);
                    tracing::info!(
                        id = id.as_str(),
                        connection = %connection,
                        attempts = attempt + 1,
                        "Client registered"
                    );
                    return Ok(id);
                }
                Entry::Occupied(taken) => {
                    tracing::debug!(id = taken.key().as_str(), "Identifier taken, retrying");
                }
            }
        }

        Err(RelayError::IdentityExhausted {
            attempts: MAX_ALLOCATION_ATTEMPTS,
        })
    }

    /// Remove `id`. Returns whether anything was removed.
    #[allow(dead_code)]
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.peers.remove(id).is_some();
        if removed {
            tracing::info!(id = id, "Client unregistered");
        }
        removed
    }

    /// Remove `id` only while it still belongs to `connection`, so a session
    /// that was evicted cannot unregister the participant that replaced it.
    pub fn unregister_connection(&self, id: &str, connection: ConnectionId) -> bool {
        let removed = self
            .peers
            .remove_if(id, |_, handle| handle.connection() == connection)
            .is_some();
        if removed {
            tracing::info!(id = id, connection = %connection, "Client unregistered");
        }
        removed
    }

    pub fn lookup(&self, id: &str) -> Option<PeerHandle> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    #[allow(dead_code)]
    pub fn is_online(&self, id: &str) -> bool {
        self.peers.contains_key(id)
    }

    /// Send to `id` if online. Returns true if the message was queued.
    pub fn send_to(&self, id: &str, message: ServerMessage) -> bool {
        match self.lookup(id) {
            Some(handle) => handle.send(message),
            None => false,
        }
    }

    /// Sorted copy of all registered identifiers.
    #[allow(dead_code)]
    pub fn snapshot_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Copy of all registered handles.
    pub fn snapshot_handles(&self) -> Vec<(String, PeerHandle)> {
        self.peers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn online_count(&self) -> usize {
        self.peers.len()
    }
}
