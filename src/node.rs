//! The node: per-connection state machine and gossip controller.
//!
//! All transitions, registry mutations, and crypto run on one logical
//! thread; transport events arrive as discrete, non-reentrant calls
//! (`handle_open`, `handle_message`, `handle_close`, `handle_error`). Every
//! fatal path converges on [Node::disconnect]; nothing is retried.

use crate::{
    connection::{format_url, host_port, is_loopback, Connection, Direction, Expectation, SocketId, State},
    crypto::{CryptoEngine, Identity, PeerId, Sealed},
    registry::Registry,
    wire::{
        AckData, ChatData, Command, Envelope, HandshakeData, Payload, PeerDescriptor, PeersData,
    },
    Config, Error, Mailbox, Transport, CLOSE_NORMAL, CLOSE_PROTOCOL_ERROR,
};
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

/// Exact plaintext both sides must recover when proving the freshly derived
/// key during the handshake.
const VERIFICATION_PHRASE: &[u8] = b"murmur handshake verification";

/// One chat node: an identity, a registry of connections, and the state
/// machine driving both.
pub struct Node<R: Rng + CryptoRng, T: Transport, M: Mailbox> {
    config: Config,
    rng: R,
    engine: CryptoEngine,
    registry: Registry,
    transport: T,
    mailbox: M,
}

impl<R: Rng + CryptoRng, T: Transport, M: Mailbox> Node<R, T, M> {
    pub fn new(mut rng: R, config: Config, transport: T, mailbox: M) -> Self {
        let identity = Identity::generate(&mut rng, &config.name);
        info!(id = %identity.id(), name = %config.name, "identity generated");
        Self {
            config,
            rng,
            engine: CryptoEngine::new(identity),
            registry: Registry::new(),
            transport,
            mailbox,
        }
    }

    pub fn id(&self) -> PeerId {
        self.engine.identity().id()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Snapshot of `{url, id, keys}` for every connection in state READY
    /// with all identity fields populated.
    pub fn ready_peers(&self) -> Vec<PeerDescriptor> {
        self.registry.ready_peers(None)
    }

    pub fn connected_urls(&self) -> Vec<String> {
        self.registry.connected_urls()
    }

    /// Display name a connected peer presented at its handshake.
    pub fn peer_name(&self, peer: &PeerId) -> Option<String> {
        let socket = self.registry.socket_for_peer(peer)?;
        self.registry.get(&socket)?.peer_name.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    #[cfg(test)]
    pub(crate) fn state_of(&self, socket: &SocketId) -> Option<State> {
        self.registry.get(socket).map(|c| c.state)
    }

    /// Dial every seed URL from the configuration.
    pub fn bootstrap(&mut self) {
        for url in self.config.seeds.clone() {
            if let Err(err) = self.connect(&url) {
                warn!(url, %err, "failed to dial seed");
            }
        }
    }

    /// Dial `url`. No-op with a warning if the URL already maps to a live
    /// connection.
    pub fn connect(&mut self, url: &str) -> Result<Option<SocketId>, Error> {
        self.connect_with(url, None)
    }

    fn connect_with(
        &mut self,
        url: &str,
        expectation: Option<Expectation>,
    ) -> Result<Option<SocketId>, Error> {
        if self.registry.contains_url(url) {
            warn!(url, "already connected to url");
            return Ok(None);
        }
        if let Some(expected) = &expectation {
            if self.registry.socket_for_peer(&expected.id).is_some() {
                warn!(url, peer = %expected.id, "already connected to peer");
                return Ok(None);
            }
        }
        let (host, port) = host_port(url)?;
        let socket = SocketId::generate(&mut self.rng);
        self.registry.insert(Connection::outbound(
            socket,
            url.to_string(),
            host,
            port,
            expectation,
        ));
        if let Err(err) = self.transport.dial(&socket, url) {
            // Failed dials are reported and rolled back, never retried.
            self.registry.remove(&socket);
            return Err(err);
        }
        debug!(socket = %socket, url, "dialing");
        Ok(Some(socket))
    }

    /// Register a socket the transport accepted. The connection stays in
    /// CREATED until the remote's HANDSHAKE arrives.
    pub fn accept(&mut self, remote_address: &str, remote_port: u16) -> SocketId {
        let socket = SocketId::generate(&mut self.rng);
        self.registry.insert(Connection::inbound(
            socket,
            remote_address.to_string(),
            remote_port,
        ));
        debug!(socket = %socket, address = remote_address, port = remote_port, "accepted");
        socket
    }

    /// The transport reports a socket open. Outbound connections send their
    /// HANDSHAKE immediately; inbound connections wait for the remote's.
    pub fn handle_open(&mut self, socket: &SocketId) {
        let Some(connection) = self.registry.get(socket) else {
            debug!(socket = %socket, "open for unknown socket");
            return;
        };
        if connection.direction != Direction::Outbound {
            return;
        }
        let data = self.handshake_data();
        if let Err(err) = self.send_plain(socket, Command::Handshake, &data) {
            warn!(socket = %socket, %err, "failed to send handshake");
            self.disconnect(socket, CLOSE_NORMAL);
        }
    }

    /// One inbound frame. Malformed envelopes and stray bad signatures are
    /// dropped; everything the state machine rejects closes the connection
    /// with code 1003 and purges it.
    pub fn handle_message(&mut self, socket: &SocketId, frame: &[u8]) {
        let Some(connection) = self.registry.get(socket) else {
            debug!(socket = %socket, "message for unknown socket");
            return;
        };
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(socket = %socket, %err, "dropping malformed envelope");
                return;
            }
        };
        let payload = match Payload::decode(&envelope.message) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(socket = %socket, %err, "dropping invalid payload");
                return;
            }
        };
        // The HANDSHAKE authenticates itself with the key it carries
        // (first-trust bootstrap, checked in the handler). Everything else
        // verifies against the key pinned at the handshake; failures are
        // noise, not a protocol violation.
        if payload.command != Command::Handshake {
            if let Some(key) = connection.peer_signing_public_key {
                if !CryptoEngine::verify(&envelope.message, &key, &envelope.signature) {
                    debug!(socket = %socket, command = %payload.command, "dropping message with invalid signature");
                    return;
                }
            }
        }
        if let Err(err) = self.process(socket, &envelope, payload) {
            warn!(socket = %socket, %err, "protocol violation");
            self.disconnect(socket, CLOSE_PROTOCOL_ERROR);
        }
    }

    /// The transport reports the socket closed by the remote.
    pub fn handle_close(&mut self, socket: &SocketId, code: u16) {
        debug!(socket = %socket, code, "remote closed");
        self.purge(socket);
    }

    /// The transport reports a socket error. Indistinguishable from a close
    /// as far as the registry is concerned.
    pub fn handle_error(&mut self, socket: &SocketId, error: &str) {
        warn!(socket = %socket, error, "transport error");
        self.transport.close(socket, CLOSE_NORMAL);
        self.purge(socket);
    }

    /// Send a chat line to every ready peer. Messages are delivered to each
    /// peer once and never forwarded.
    pub fn broadcast(&mut self, message: &str) {
        let chat = ChatData {
            message: message.to_string(),
            from: self.id(),
        };
        for socket in self.registry.ready_sockets(None) {
            let Some(peer) = self.registry.get(&socket).and_then(|c| c.peer_id) else {
                continue;
            };
            if let Err(err) = self.send_sealed(&socket, &peer, Command::SendMessage, &chat) {
                warn!(socket = %socket, %err, "failed to send chat message");
            }
        }
    }

    /// Close a connection and purge all registry state for it. The single
    /// convergence point for every fatal path.
    pub fn disconnect(&mut self, socket: &SocketId, code: u16) {
        self.transport.close(socket, code);
        self.purge(socket);
    }

    /// Periodic housekeeping: logs registry composition and mutates nothing.
    pub fn tick(&self) {
        let census = self.registry.census();
        let ready = census.get(&State::Ready).copied().unwrap_or(0);
        info!(
            connections = self.registry.len(),
            ready, "registry status"
        );
    }

    fn purge(&mut self, socket: &SocketId) {
        let Some(connection) = self.registry.remove(socket) else {
            return;
        };
        if let Some(peer) = connection.peer_id {
            // Only invalidate the derived secret if no other connection
            // still owns this peer id.
            if self.registry.socket_for_peer(&peer).is_none() {
                self.engine.forget(&peer);
            }
        }
        info!(socket = %socket, state = %connection.state, "connection removed");
    }

    fn process(
        &mut self,
        socket: &SocketId,
        envelope: &Envelope,
        payload: Payload,
    ) -> Result<(), Error> {
        let Some(state) = self.registry.get(socket).map(|c| c.state) else {
            return Ok(());
        };
        match (state, payload.command) {
            (State::Created, Command::Handshake) => self.on_handshake(socket, envelope, &payload),
            (State::HandshakeStarted, Command::HandshakeVerification) => {
                self.on_verification(socket, &payload)
            }
            (State::HandshakeValidated, Command::HandshakeAck) => self.on_ack(socket, &payload),
            (State::Ready, Command::GetPeers) => self.on_get_peers(socket, &payload),
            (State::Ready, Command::GetPeersResponse) => self.on_peers_response(socket, &payload),
            (State::Ready, Command::AnnouncePeer) => self.on_announce(socket, &payload),
            (State::Ready, Command::SendMessage) => self.on_chat(socket, &payload),
            (state, command) => Err(Error::UnexpectedCommand { state, command }),
        }
    }

    fn on_handshake(
        &mut self,
        socket: &SocketId,
        envelope: &Envelope,
        payload: &Payload,
    ) -> Result<(), Error> {
        let data: HandshakeData = payload.data()?;
        let signing_key = CryptoEngine::parse_signing_key(&data.signing_public_key)
            .ok_or(Error::InvalidPublicKey)?;
        let exchange_key = CryptoEngine::parse_exchange_key(&data.exchange_public_key)
            .ok_or(Error::InvalidPublicKey)?;

        // First-trust bootstrap: the signature is verified against the key
        // embedded in this same message. There is no external root of trust
        // for a peer's initial connection.
        if !CryptoEngine::verify(&envelope.message, &signing_key, &envelope.signature) {
            return Err(Error::InvalidSignature);
        }

        let (direction, remote_address) = {
            let Some(connection) = self.registry.get(socket) else {
                return Ok(());
            };

            // A loopback remote claiming our own listen port is this node
            // talking to itself through a spoofed announcement.
            if is_loopback(&connection.remote_address) && data.port == self.config.port {
                return Err(Error::SelfConnect);
            }

            // Connections dialed off gossip must be answered by the peer
            // the announcement named.
            if let Some(expected) = &connection.announced {
                if expected.id != data.id
                    || expected.signing_public_key.to_bytes() != signing_key.to_bytes()
                    || expected.exchange_public_key.as_bytes() != exchange_key.as_bytes()
                {
                    return Err(Error::AnnouncementMismatch);
                }
            }
            (connection.direction, connection.remote_address.clone())
        };

        // One live connection per authenticated peer. A second handshake
        // with the same id is rejected, except when it is the winning half
        // of a crossed dial, in which case the loser is evicted instead.
        if let Some(existing) = self.registry.socket_for_peer(&data.id) {
            if !self.replaces_existing(&existing, direction, &data.id) {
                return Err(Error::DuplicatePeer(data.id));
            }
            info!(socket = %socket, evicted = %existing, peer = %data.id, "replacing crossed connection");
            self.disconnect(&existing, CLOSE_NORMAL);
        }

        self.engine.begin_exchange(data.id, &exchange_key);
        if let Some(connection) = self.registry.get_mut(socket) {
            connection.peer_id = Some(data.id);
            connection.peer_name = Some(data.name.clone());
            connection.peer_signing_public_key = Some(signing_key);
            connection.peer_exchange_public_key = Some(exchange_key);
        }
        if direction == Direction::Inbound {
            // The claimed listen port gives inbound connections a dialable
            // URL for gossip.
            let url = format_url(&remote_address, data.port);
            self.registry.bind_url(*socket, url);
        }
        self.registry.bind_peer(*socket, data.id);
        info!(socket = %socket, peer = %data.id, name = %data.name, "handshake accepted");

        if direction == Direction::Inbound {
            let ours = self.handshake_data();
            self.send_plain(socket, Command::Handshake, &ours)?;
        }
        let proof = self
            .engine
            .encrypt(&mut self.rng, &data.id, VERIFICATION_PHRASE)?;
        self.send_plain(socket, Command::HandshakeVerification, &proof)?;
        if let Some(connection) = self.registry.get_mut(socket) {
            connection.advance(State::HandshakeStarted);
        }
        Ok(())
    }

    fn on_verification(&mut self, socket: &SocketId, payload: &Payload) -> Result<(), Error> {
        let peer = self
            .registry
            .get(socket)
            .and_then(|c| c.peer_id)
            .ok_or(Error::HandshakeNotCompleted)?;
        let sealed: Sealed = payload.data()?;
        let plaintext = self.engine.decrypt(&peer, &sealed)?;
        if plaintext != VERIFICATION_PHRASE {
            return Err(Error::InvalidConfirmation);
        }
        self.send_plain(socket, Command::HandshakeAck, &AckData { success: true })?;
        if let Some(connection) = self.registry.get_mut(socket) {
            connection.advance(State::HandshakeValidated);
        }
        Ok(())
    }

    fn on_ack(&mut self, socket: &SocketId, payload: &Payload) -> Result<(), Error> {
        let _: AckData = payload.data()?;
        let peer = {
            let Some(connection) = self.registry.get_mut(socket) else {
                return Ok(());
            };
            connection.advance(State::Ready);
            connection.peer_id.ok_or(Error::HandshakeNotCompleted)?
        };
        info!(socket = %socket, peer = %peer, "connection ready");

        // Reaching READY: learn the remote's peers, and introduce the new
        // peer to everyone else.
        self.send_sealed(socket, &peer, Command::GetPeers, &Value::Object(Default::default()))?;
        self.announce(socket);
        Ok(())
    }

    fn on_get_peers(&mut self, socket: &SocketId, payload: &Payload) -> Result<(), Error> {
        let (peer, _request): (_, Value) = self.open_sealed(socket, payload)?;
        let peers = self.registry.ready_peers(Some(socket));
        self.send_sealed(socket, &peer, Command::GetPeersResponse, &PeersData { peers })
    }

    fn on_peers_response(&mut self, socket: &SocketId, payload: &Payload) -> Result<(), Error> {
        let (peer, data): (_, PeersData) = self.open_sealed(socket, payload)?;
        for descriptor in data.peers {
            self.consider(peer, descriptor);
        }
        Ok(())
    }

    fn on_announce(&mut self, socket: &SocketId, payload: &Payload) -> Result<(), Error> {
        let (peer, descriptor): (_, PeerDescriptor) = self.open_sealed(socket, payload)?;
        self.consider(peer, descriptor);
        Ok(())
    }

    fn on_chat(&mut self, socket: &SocketId, payload: &Payload) -> Result<(), Error> {
        let (peer, chat): (_, ChatData) = self.open_sealed(socket, payload)?;
        // The connection, not the payload, proves authorship.
        debug!(from = %peer, "chat message received");
        self.mailbox.deliver(&peer, &chat.message);
        Ok(())
    }

    /// Whether a handshake on a new connection should evict an existing
    /// connection to the same peer.
    ///
    /// When two nodes dial each other at once, each authenticates the
    /// other's inbound socket first and then sees the second handshake as a
    /// duplicate; always keeping the existing connection would tear down
    /// both. Both ends must pick the same survivor without coordinating:
    /// the connection dialed by the lower peer id wins, the other is
    /// evicted.
    fn replaces_existing(
        &self,
        existing: &SocketId,
        direction: Direction,
        peer: &PeerId,
    ) -> bool {
        let preferred = if self.id() < *peer {
            Direction::Outbound
        } else {
            Direction::Inbound
        };
        if direction != preferred {
            return false;
        }
        self.registry
            .get(existing)
            .map_or(false, |c| c.direction != preferred)
    }

    /// Dial a gossiped peer unless the URL is our own listen address or one
    /// we already hold a connection to. The filter checks the URL only: a
    /// known peer advertised under a new address will be dialed again.
    fn consider(&mut self, announced_by: PeerId, descriptor: PeerDescriptor) {
        if descriptor.url == self.config.url() || self.registry.contains_url(&descriptor.url) {
            return;
        }
        let expectation = match Expectation::from_descriptor(announced_by, &descriptor) {
            Ok(expectation) => expectation,
            Err(err) => {
                warn!(url = %descriptor.url, %err, "ignoring announced peer with malformed keys");
                return;
            }
        };
        if let Err(err) = self.connect_with(&descriptor.url, Some(expectation)) {
            warn!(url = %descriptor.url, %err, "failed to dial announced peer");
        }
    }

    /// Fan this peer's descriptor out to every other READY connection.
    fn announce(&mut self, socket: &SocketId) {
        let Some(descriptor) = self.registry.get(socket).and_then(|c| c.descriptor()) else {
            return;
        };
        for other in self.registry.ready_sockets(Some(socket)) {
            let Some(peer) = self.registry.get(&other).and_then(|c| c.peer_id) else {
                continue;
            };
            if let Err(err) = self.send_sealed(&other, &peer, Command::AnnouncePeer, &descriptor) {
                warn!(socket = %other, %err, "announce failed");
            }
        }
    }

    /// Decrypt a post-READY payload and interpret its plaintext.
    fn open_sealed<D: for<'de> Deserialize<'de>>(
        &self,
        socket: &SocketId,
        payload: &Payload,
    ) -> Result<(PeerId, D), Error> {
        let peer = self
            .registry
            .get(socket)
            .and_then(|c| c.peer_id)
            .ok_or(Error::HandshakeNotCompleted)?;
        let sealed: Sealed = payload.data()?;
        let plaintext = self.engine.decrypt(&peer, &sealed)?;
        Ok((peer, serde_json::from_slice(&plaintext)?))
    }

    fn handshake_data(&self) -> HandshakeData {
        let identity = self.engine.identity();
        HandshakeData {
            id: identity.id(),
            name: identity.name().to_string(),
            port: self.config.port,
            signing_public_key: identity.signing_public_key().to_bytes().to_vec(),
            exchange_public_key: identity.exchange_public_key().as_bytes().to_vec(),
        }
    }

    fn send_plain<D: Serialize>(
        &mut self,
        socket: &SocketId,
        command: Command,
        data: &D,
    ) -> Result<(), Error> {
        let payload = Payload::new(command, data)?;
        let message = payload.encode();
        let signature = self.engine.sign(&message);
        let frame = Envelope::new(message, &signature).encode();
        self.transport.send(socket, frame)
    }

    fn send_sealed<D: Serialize>(
        &mut self,
        socket: &SocketId,
        peer: &PeerId,
        command: Command,
        data: &D,
    ) -> Result<(), Error> {
        let plaintext = serde_json::to_vec(data)?;
        let sealed = self.engine.encrypt(&mut self.rng, peer, &plaintext)?;
        self.send_plain(socket, command, &sealed)
    }
}
