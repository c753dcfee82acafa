//! Bookkeeping for all live connections.
//!
//! The registry owns every [Connection] exclusively and keeps two secondary
//! indices: remote URL -> socket (prevents dialing an address twice) and
//! authenticated peer id -> socket (prevents two simultaneous connections to
//! one logical peer). Removal is atomic across all three maps, so every
//! index entry always points at a live connection.

use crate::{
    connection::{Connection, SocketId, State},
    crypto::PeerId,
    wire::PeerDescriptor,
};
use std::collections::HashMap;
use tracing::debug;

#[derive(Default)]
pub struct Registry {
    connections: HashMap<SocketId, Connection>,
    url_index: HashMap<String, SocketId>,
    peer_index: HashMap<PeerId, SocketId>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection, indexing its URL if it has one (outbound
    /// connections are born with their dial URL).
    pub fn insert(&mut self, connection: Connection) {
        if let Some(url) = connection.url.clone() {
            self.url_index.insert(url, connection.socket);
        }
        self.connections.insert(connection.socket, connection);
    }

    pub fn get(&self, socket: &SocketId) -> Option<&Connection> {
        self.connections.get(socket)
    }

    pub fn get_mut(&mut self, socket: &SocketId) -> Option<&mut Connection> {
        self.connections.get_mut(socket)
    }

    /// Record an inbound connection's URL once the handshake reveals the
    /// peer's listen port. The connection keeps the URL either way; if
    /// another live connection already claims the index entry (both ends
    /// dialed at once), the entry stays with the first claimant and passes
    /// here only when that connection is removed.
    pub fn bind_url(&mut self, socket: SocketId, url: String) {
        let Some(connection) = self.connections.get_mut(&socket) else {
            return;
        };
        connection.url = Some(url.clone());
        if let Some(existing) = self.url_index.get(&url) {
            if *existing != socket {
                debug!(url, socket = %socket, "url already claimed by another connection");
                return;
            }
        }
        self.url_index.insert(url, socket);
    }

    /// Index a connection under its authenticated peer id.
    pub fn bind_peer(&mut self, socket: SocketId, peer: PeerId) {
        self.peer_index.insert(peer, socket);
    }

    /// Remove a connection and all index entries pointing at it. A freed
    /// URL claim passes to a surviving connection recorded under the same
    /// URL (the other half of a crossed dial), so the survivor stays
    /// visible to the de-duplication filters.
    pub fn remove(&mut self, socket: &SocketId) -> Option<Connection> {
        let connection = self.connections.remove(socket)?;
        if let Some(url) = &connection.url {
            if self.url_index.get(url) == Some(socket) {
                self.url_index.remove(url);
                let survivor = self
                    .connections
                    .values()
                    .find(|c| c.url.as_deref() == Some(url.as_str()))
                    .map(|c| c.socket);
                if let Some(next) = survivor {
                    self.url_index.insert(url.clone(), next);
                }
            }
        }
        if let Some(peer) = &connection.peer_id {
            if self.peer_index.get(peer) == Some(socket) {
                self.peer_index.remove(peer);
            }
        }
        Some(connection)
    }

    pub fn contains_url(&self, url: &str) -> bool {
        self.url_index.contains_key(url)
    }

    pub fn socket_for_peer(&self, peer: &PeerId) -> Option<SocketId> {
        self.peer_index.get(peer).copied()
    }

    /// Sockets of all connections in state READY, optionally excluding one.
    pub fn ready_sockets(&self, except: Option<&SocketId>) -> Vec<SocketId> {
        self.connections
            .values()
            .filter(|c| c.state == State::Ready && Some(&c.socket) != except)
            .map(|c| c.socket)
            .collect()
    }

    /// Snapshot of every ready peer's descriptor, the view used to answer
    /// discovery queries.
    pub fn ready_peers(&self, except: Option<&SocketId>) -> Vec<PeerDescriptor> {
        self.connections
            .values()
            .filter(|c| Some(&c.socket) != except)
            .filter_map(|c| c.descriptor())
            .collect()
    }

    /// Snapshot of URLs for ready, identified connections; used by gossip
    /// de-duplication filters.
    pub fn connected_urls(&self) -> Vec<String> {
        self.connections
            .values()
            .filter(|c| c.is_ready())
            .filter_map(|c| c.url.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Connection counts by state, for housekeeping logs.
    pub fn census(&self) -> HashMap<State, usize> {
        let mut counts = HashMap::new();
        for connection in self.connections.values() {
            *counts.entry(connection.state).or_insert(0) += 1;
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn outbound(rng: &mut StdRng, url: &str) -> Connection {
        let (host, port) = crate::connection::host_port(url).unwrap();
        Connection::outbound(SocketId::generate(rng), url.to_string(), host, port, None)
    }

    #[test]
    fn test_insert_indexes_outbound_url() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut registry = Registry::new();
        let connection = outbound(&mut rng, "ws://10.0.0.1:9000");
        let socket = connection.socket;
        registry.insert(connection);
        assert!(registry.contains_url("ws://10.0.0.1:9000"));
        assert!(registry.get(&socket).is_some());
    }

    #[test]
    fn test_remove_is_atomic() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut registry = Registry::new();
        let peer = PeerId::generate(&mut rng);
        let mut connection = outbound(&mut rng, "ws://10.0.0.1:9000");
        connection.peer_id = Some(peer);
        let socket = connection.socket;
        registry.insert(connection);
        registry.bind_peer(socket, peer);

        registry.remove(&socket);
        assert!(registry.get(&socket).is_none());
        assert!(!registry.contains_url("ws://10.0.0.1:9000"));
        assert!(registry.socket_for_peer(&peer).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_preserves_other_claims() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut registry = Registry::new();
        let peer = PeerId::generate(&mut rng);

        let first = outbound(&mut rng, "ws://10.0.0.1:9000");
        let first_socket = first.socket;
        registry.insert(first);
        registry.bind_peer(first_socket, peer);

        // A second connection carrying the same peer id but never indexed
        // (the duplicate guard rejects it before binding). Removing it must
        // not disturb the first connection's index entries.
        let mut second = outbound(&mut rng, "ws://10.0.0.2:9000");
        second.peer_id = Some(peer);
        let second_socket = second.socket;
        registry.insert(second);

        registry.remove(&second_socket);
        assert_eq!(registry.socket_for_peer(&peer), Some(first_socket));
        assert!(registry.contains_url("ws://10.0.0.1:9000"));
    }

    #[test]
    fn test_url_claim_passes_to_survivor() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut registry = Registry::new();

        let first = Connection::inbound(SocketId::generate(&mut rng), "10.0.0.1".into(), 50001);
        let first_socket = first.socket;
        registry.insert(first);
        registry.bind_url(first_socket, "ws://10.0.0.1:9000".into());

        // Both ends of a crossed dial record the same URL; the index entry
        // stays with the first claimant while both are alive.
        let second = Connection::inbound(SocketId::generate(&mut rng), "10.0.0.1".into(), 50002);
        let second_socket = second.socket;
        registry.insert(second);
        registry.bind_url(second_socket, "ws://10.0.0.1:9000".into());
        assert_eq!(
            registry.get(&second_socket).unwrap().url.as_deref(),
            Some("ws://10.0.0.1:9000")
        );
        assert!(registry.contains_url("ws://10.0.0.1:9000"));

        // Removing the claimant hands the entry to the survivor instead of
        // leaving the survivor unindexed (and invisible to de-duplication).
        registry.remove(&first_socket);
        assert!(registry.contains_url("ws://10.0.0.1:9000"));
        registry.remove(&second_socket);
        assert!(!registry.contains_url("ws://10.0.0.1:9000"));
    }

    #[test]
    fn test_ready_views_exclude_unidentified() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut registry = Registry::new();
        let connection = outbound(&mut rng, "ws://10.0.0.1:9000");
        let socket = connection.socket;
        registry.insert(connection);

        // Created, no identity: not a ready peer.
        assert!(registry.ready_peers(None).is_empty());
        assert!(registry.ready_sockets(None).is_empty());

        // Force it ready with identity fields, as the handshake would.
        let identity = crate::crypto::Identity::generate(&mut rng, "peer");
        let connection = registry.get_mut(&socket).unwrap();
        connection.peer_id = Some(identity.id());
        connection.peer_name = Some("peer".into());
        connection.peer_signing_public_key = Some(identity.signing_public_key());
        connection.peer_exchange_public_key = Some(identity.exchange_public_key());
        connection.state = State::Ready;

        assert_eq!(registry.ready_peers(None).len(), 1);
        assert_eq!(registry.ready_sockets(Some(&socket)).len(), 0);
        assert_eq!(registry.connected_urls(), vec!["ws://10.0.0.1:9000"]);
    }
}
