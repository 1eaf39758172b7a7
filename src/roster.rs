//! Client roster — bind/rebind, presence, and peer reconciliation.
//!
//! DESIGN
//! ======
//! Clients are keyed by uuid. A record outlives its socket: disconnecting
//! marks the client offline but keeps the `(uuid, pin)` pair bindable, and
//! records are only dropped when their hosting server is declared dead.
//! The uuid -> socket index is a lookup edge, never ownership. It exists
//! only for clients hosted on this server, and holds at most one sender
//! per uuid. Presenting a matching `(uuid, pin)` takes the identity over
//! and the previous socket (if any) is handed back for a forced
//! disconnect.

use std::collections::HashMap;
use std::fmt::Write as _;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::{BindRequest, DistClient, ServerEvent, NAME_MAX, NAME_MIN, UUID_LEN};

/// What a per-connection channel carries: outbound events, or the order
/// to close the connection (identity takeover, snapshot reload).
#[derive(Debug)]
pub enum SocketMessage {
    Event(ServerEvent),
    Kick,
}

pub type SocketSender = mpsc::Sender<SocketMessage>;

// =============================================================================
// CLIENT RECORD
// =============================================================================

/// Full client record. Crosses the server-to-server boundary in `provide`
/// frames; end-user clients only ever see the [`DistClient`] projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub uuid: Uuid,
    /// Re-bind secret, generated server-side at first bind.
    pub pin: String,
    pub name: String,
    pub remote_addr: String,
    pub is_online: bool,
    pub server_id: Uuid,
}

impl Client {
    #[must_use]
    pub fn distributable(&self) -> DistClient {
        DistClient { uuid: self.uuid, name: self.name.clone(), server_id: self.server_id }
    }
}

/// Generate a fresh 16-byte hex pin.
#[must_use]
fn generate_pin() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

// =============================================================================
// ROSTER
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("name length out of range {NAME_MIN}..={NAME_MAX}")]
    InvalidName,
    #[error("uuid length is not {UUID_LEN}")]
    InvalidUuid,
}

/// Result of a successful bind.
pub struct BindOutcome {
    pub client: Client,
    pub rebound: bool,
    /// The previously attached socket, to be force-disconnected.
    pub kicked: Option<SocketSender>,
}

#[derive(Default)]
pub struct Roster {
    clients: HashMap<Uuid, Client>,
    sockets: HashMap<Uuid, SocketSender>,
}

impl Roster {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a socket to an identity. A matching `(uuid, pin)` takes over
    /// the existing record; anything else creates a fresh client with a
    /// new uuid and pin.
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range names or a present uuid whose
    /// length is not 36; the caller drops the event silently.
    pub fn bind(
        &mut self,
        req: &BindRequest,
        remote_addr: &str,
        server_id: Uuid,
        socket: SocketSender,
    ) -> Result<BindOutcome, RosterError> {
        let name_len = req.name.chars().count();
        if !(NAME_MIN..=NAME_MAX).contains(&name_len) {
            return Err(RosterError::InvalidName);
        }

        if let Some(uuid_str) = &req.uuid {
            if uuid_str.chars().count() != UUID_LEN {
                return Err(RosterError::InvalidUuid);
            }
            if let Ok(uuid) = uuid_str.parse::<Uuid>() {
                if let (Some(existing), Some(pin)) = (self.clients.get_mut(&uuid), req.pin.as_deref()) {
                    if existing.pin == pin {
                        existing.name = req.name.clone();
                        existing.remote_addr = remote_addr.to_string();
                        existing.is_online = true;
                        existing.server_id = server_id;
                        let client = existing.clone();
                        let kicked = self.sockets.insert(uuid, socket);
                        return Ok(BindOutcome { client, rebound: true, kicked });
                    }
                }
            }
        }

        let client = Client {
            uuid: Uuid::new_v4(),
            pin: generate_pin(),
            name: req.name.clone(),
            remote_addr: remote_addr.to_string(),
            is_online: true,
            server_id,
        };
        self.sockets.insert(client.uuid, socket);
        self.clients.insert(client.uuid, client.clone());
        Ok(BindOutcome { client, rebound: false, kicked: None })
    }

    /// Clear the socket index and mark the client offline. The record is
    /// retained so the `(uuid, pin)` pair can rebind later.
    pub fn mark_offline(&mut self, uuid: Uuid) {
        self.sockets.remove(&uuid);
        if let Some(client) = self.clients.get_mut(&uuid) {
            client.is_online = false;
        }
    }

    /// Like [`mark_offline`](Self::mark_offline), but only when `sender`
    /// is still the indexed socket for this uuid. After an identity
    /// takeover the kicked connection's teardown must not clobber the new
    /// socket's index entry.
    pub fn mark_offline_if_current(&mut self, uuid: Uuid, sender: &SocketSender) -> bool {
        match self.sockets.get(&uuid) {
            Some(current) if current.same_channel(sender) => {
                self.mark_offline(uuid);
                true
            }
            _ => false,
        }
    }

    /// Replace every record hosted by `peer_server_id` with the peer's
    /// authoritative list. Never touches the local socket index.
    pub fn reconcile(&mut self, peer_server_id: Uuid, peer_clients: Vec<Client>) {
        self.clients.retain(|_, c| c.server_id != peer_server_id);
        for client in peer_clients {
            if client.server_id == peer_server_id {
                self.clients.insert(client.uuid, client);
            }
        }
    }

    /// Drop every record hosted on any of the given server ids.
    pub fn prune_dead_servers(&mut self, ids: &[Uuid]) {
        self.clients.retain(|_, c| !ids.contains(&c.server_id));
    }

    /// Public projection of every online client.
    #[must_use]
    pub fn snapshot_online(&self) -> Vec<DistClient> {
        self.clients
            .values()
            .filter(|c| c.is_online)
            .map(Client::distributable)
            .collect()
    }

    /// Full records of clients hosted on this server, for `provide`.
    #[must_use]
    pub fn local_clients(&self, server_id: Uuid) -> Vec<Client> {
        self.clients
            .values()
            .filter(|c| c.server_id == server_id)
            .cloned()
            .collect()
    }

    /// Distinct server ids other than ours that host roster records.
    #[must_use]
    pub fn remote_server_ids(&self, self_id: Uuid) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .clients
            .values()
            .map(|c| c.server_id)
            .filter(|id| *id != self_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[must_use]
    pub fn get(&self, uuid: Uuid) -> Option<&Client> {
        self.clients.get(&uuid)
    }

    #[must_use]
    pub fn socket(&self, uuid: Uuid) -> Option<SocketSender> {
        self.sockets.get(&uuid).cloned()
    }

    /// Clones of every locally attached socket sender.
    #[must_use]
    pub fn senders(&self) -> Vec<(Uuid, SocketSender)> {
        self.sockets
            .iter()
            .map(|(uuid, tx)| (*uuid, tx.clone()))
            .collect()
    }

    /// Detach every socket, marking their clients offline, and return the
    /// senders so the caller can deliver the kick order.
    pub fn kick_all(&mut self) -> Vec<SocketSender> {
        let drained: Vec<(Uuid, SocketSender)> = self.sockets.drain().collect();
        let mut senders = Vec::with_capacity(drained.len());
        for (uuid, sender) in drained {
            if let Some(client) = self.clients.get_mut(&uuid) {
                client.is_online = false;
            }
            senders.push(sender);
        }
        senders
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }
}

#[cfg(test)]
#[path = "roster_test.rs"]
mod tests;
