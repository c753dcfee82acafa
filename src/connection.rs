//! Per-socket connection records.

use crate::{crypto::PeerId, wire::PeerDescriptor, Error};
use ed25519_consensus::VerificationKey;
use rand::{CryptoRng, Rng};
use std::fmt::{Debug, Display};
use x25519_dalek::PublicKey as ExchangePublicKey;

const SOCKET_ID_LENGTH: usize = 8;

/// Process-local random identifier for one transport socket, stable for the
/// connection's life. Distinct from the cryptographic peer id.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId([u8; SOCKET_ID_LENGTH]);

impl SocketId {
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut raw = [0u8; SOCKET_ID_LENGTH];
        rng.fill_bytes(&mut raw);
        Self(raw)
    }
}

impl Display for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for SocketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SocketId({})", hex::encode(self.0))
    }
}

/// Lifecycle of a connection. Progression is strictly forward; any protocol
/// violation jumps straight to `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Created = 0,
    HandshakeStarted = 1,
    HandshakeValidated = 2,
    Ready = 3,
    Closed = 4,
}

impl Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Created => "CREATED",
            Self::HandshakeStarted => "HANDSHAKE_STARTED",
            Self::HandshakeValidated => "HANDSHAKE_VALIDATED",
            Self::Ready => "READY",
            Self::Closed => "CLOSED",
        };
        write!(f, "{}", name)
    }
}

/// Whether we accepted or dialed the socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Identity we expect on the far end of a connection dialed in response to a
/// gossip announcement. A HANDSHAKE that contradicts any field is treated as
/// announcement spoofing and terminates the connection.
#[derive(Clone)]
pub struct Expectation {
    pub announced_by: PeerId,
    pub id: PeerId,
    pub signing_public_key: VerificationKey,
    pub exchange_public_key: ExchangePublicKey,
}

impl Expectation {
    /// Build an expectation from a gossiped descriptor, failing on malformed
    /// keys (a peer gossiping garbage keys is a protocol violation).
    pub fn from_descriptor(announced_by: PeerId, descriptor: &PeerDescriptor) -> Result<Self, Error> {
        let signing_public_key = crate::crypto::CryptoEngine::parse_signing_key(
            &descriptor.signing_public_key,
        )
        .ok_or(Error::InvalidPublicKey)?;
        let exchange_public_key = crate::crypto::CryptoEngine::parse_exchange_key(
            &descriptor.exchange_public_key,
        )
        .ok_or(Error::InvalidPublicKey)?;
        Ok(Self {
            announced_by,
            id: descriptor.id,
            signing_public_key,
            exchange_public_key,
        })
    }
}

/// State for one transport socket. Identity fields are populated exactly
/// once, together, when the peer's HANDSHAKE is accepted.
pub struct Connection {
    pub socket: SocketId,
    pub direction: Direction,
    pub state: State,

    /// Address and port of the remote end of the socket itself.
    pub remote_address: String,
    pub remote_port: u16,

    /// URL the peer's listener is dialable at: the dialed URL for outbound
    /// connections, derived from the handshake's claimed port for inbound.
    pub url: Option<String>,

    /// Present iff this connection was dialed in response to gossip.
    pub announced: Option<Expectation>,

    // Set together, once, at the HANDSHAKE step.
    pub peer_id: Option<PeerId>,
    pub peer_name: Option<String>,
    pub peer_signing_public_key: Option<VerificationKey>,
    pub peer_exchange_public_key: Option<ExchangePublicKey>,
}

impl Connection {
    pub fn inbound(socket: SocketId, remote_address: String, remote_port: u16) -> Self {
        Self {
            socket,
            direction: Direction::Inbound,
            state: State::Created,
            remote_address,
            remote_port,
            url: None,
            announced: None,
            peer_id: None,
            peer_name: None,
            peer_signing_public_key: None,
            peer_exchange_public_key: None,
        }
    }

    pub fn outbound(
        socket: SocketId,
        url: String,
        remote_address: String,
        remote_port: u16,
        announced: Option<Expectation>,
    ) -> Self {
        Self {
            socket,
            direction: Direction::Outbound,
            state: State::Created,
            remote_address,
            remote_port,
            url: Some(url),
            announced,
            peer_id: None,
            peer_name: None,
            peer_signing_public_key: None,
            peer_exchange_public_key: None,
        }
    }

    /// Advance to `next`. States only move forward; regressions are bugs in
    /// the caller, not the remote.
    pub fn advance(&mut self, next: State) {
        debug_assert!(next > self.state, "state regression: {} -> {}", self.state, next);
        self.state = next;
    }

    /// Whether the state machine completed and all identity fields are set.
    pub fn is_ready(&self) -> bool {
        self.state == State::Ready && self.peer_id.is_some() && self.url.is_some()
    }

    /// Snapshot this connection as a gossipable descriptor, if ready.
    pub fn descriptor(&self) -> Option<PeerDescriptor> {
        if !self.is_ready() {
            return None;
        }
        Some(PeerDescriptor {
            url: self.url.clone()?,
            id: self.peer_id?,
            signing_public_key: self.peer_signing_public_key?.to_bytes().to_vec(),
            exchange_public_key: self.peer_exchange_public_key?.as_bytes().to_vec(),
        })
    }
}

/// Format a dialable `ws://host:port` URL. IPv6 hosts are bracketed so the
/// port separator stays unambiguous.
pub(crate) fn format_url(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("ws://[{}]:{}", host, port)
    } else {
        format!("ws://{}:{}", host, port)
    }
}

/// Split a `ws://host:port` URL into host and port, unbracketing IPv6
/// hosts.
pub(crate) fn host_port(url: &str) -> Result<(String, u16), Error> {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::InvalidUrl(url.to_string()))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        return Err(Error::InvalidUrl(url.to_string()));
    }
    Ok((host.to_string(), port))
}

/// Whether a remote address is a loopback interface.
pub(crate) fn is_loopback(address: &str) -> bool {
    if address == "localhost" {
        return true;
    }
    address
        .parse::<std::net::IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_ordering() {
        assert!(State::Created < State::HandshakeStarted);
        assert!(State::HandshakeStarted < State::HandshakeValidated);
        assert!(State::HandshakeValidated < State::Ready);
        assert!(State::Ready < State::Closed);
    }

    #[test]
    fn test_host_port() {
        assert_eq!(
            host_port("ws://127.0.0.1:9000").unwrap(),
            ("127.0.0.1".to_string(), 9000)
        );
        assert_eq!(
            host_port("example.org:80").unwrap(),
            ("example.org".to_string(), 80)
        );
        assert!(host_port("ws://nohost").is_err());
        assert!(host_port("ws://host:notaport").is_err());
        assert!(host_port("ws://:9000").is_err());
    }

    #[test]
    fn test_ipv6_urls_round_trip() {
        assert_eq!(format_url("::1", 9001), "ws://[::1]:9001");
        assert_eq!(format_url("2001:db8::2", 9001), "ws://[2001:db8::2]:9001");
        assert_eq!(format_url("10.0.0.2", 9001), "ws://10.0.0.2:9001");
        assert_eq!(
            host_port("ws://[2001:db8::2]:9001").unwrap(),
            ("2001:db8::2".to_string(), 9001)
        );
        assert_eq!(
            host_port(&format_url("::1", 9000)).unwrap(),
            ("::1".to_string(), 9000)
        );
    }

    #[test]
    fn test_is_loopback() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("localhost"));
        assert!(!is_loopback("192.168.1.10"));
        assert!(!is_loopback("example.org"));
    }

    #[test]
    fn test_descriptor_requires_ready() {
        let mut rng = rand::rngs::OsRng;
        let socket = SocketId::generate(&mut rng);
        let conn = Connection::inbound(socket, "127.0.0.1".into(), 50123);
        assert!(conn.descriptor().is_none());
    }
}
