//! Peer-to-peer gossip overlay for end-to-end encrypted chat.
//!
//! Each node holds a generated identity (an id, a signing keypair, and a key
//! exchange keypair) and maintains at most one connection per peer. New
//! connections walk a four-step handshake: exchange identities, derive a
//! shared secret, prove the secret by decrypting a known phrase, and
//! acknowledge. Once READY, all application payloads are encrypted with the
//! derived per-peer key, and every frame (before and after) is signed by its
//! sender.
//!
//! Peers find each other by gossip: on reaching READY a node asks the new
//! peer for its peer list and announces the new peer to everyone else, and
//! nodes dial any advertised URL they are not already connected to. Chat
//! messages go to direct peers only and are never forwarded.
//!
//! # Design
//!
//! The node is sans-IO: it performs no socket operations itself and has no
//! runtime. A host drives it by calling [Node::handle_open],
//! [Node::handle_message], [Node::handle_close], and [Node::handle_error] as
//! its transport produces events, and supplies the transport via the
//! [Transport] trait. All processing is single-threaded and non-reentrant.
//!
//! # Warning
//!
//! A peer's identity is trusted on first connection: the HANDSHAKE is
//! verified against the signing key it itself carries. The scheme
//! authenticates continuity of an identity, not who is behind it.

use bytes::Bytes;
use thiserror::Error;

mod connection;
mod crypto;
pub mod mocks;
mod node;
mod registry;
mod wire;

pub use connection::{Connection, Direction, Expectation, SocketId, State};
pub use crypto::{CryptoEngine, Identity, PeerId, Sealed};
pub use node::Node;
pub use registry::Registry;
pub use wire::{
    AckData, ChatData, Command, Envelope, HandshakeData, Payload, PeerDescriptor, PeersData,
};

/// Close code for normal, non-fault shutdown of a connection.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for a protocol violation. Every fatal processing error closes
/// with this code.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1003;

/// Errors that can occur when processing peer traffic.
#[derive(Error, Debug)]
pub enum Error {
    // Wire
    #[error("unable to decode: {0}")]
    UnableToDecode(#[from] serde_json::Error),
    #[error("payload is not an object")]
    PayloadNotObject,
    #[error("payload data is not an object")]
    DataNotObject,
    #[error("payload command missing or not an integer")]
    MissingCommand,
    #[error("unknown command: {0}")]
    UnknownCommand(u64),
    #[error("peer reported failure")]
    PeerReportedFailure,

    // Handshake
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("unexpected command {command} in state {state}")]
    UnexpectedCommand { state: State, command: Command },
    #[error("connection to self")]
    SelfConnect,
    #[error("peer does not match announcement")]
    AnnouncementMismatch,
    #[error("peer already connected: {0}")]
    DuplicatePeer(PeerId),
    #[error("confirmation phrase mismatch")]
    InvalidConfirmation,

    // Cipher
    #[error("handshake not completed")]
    HandshakeNotCompleted,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,

    // Transport
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("dial failed: {0}")]
    DialFailed(String),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Node configuration. `seeds` are dialed once at [Node::bootstrap]; failed
/// dials are not retried.
#[derive(Clone, Debug)]
pub struct Config {
    /// Display name presented in the handshake.
    pub name: String,
    /// Host other peers can dial this node at.
    pub host: String,
    /// Listen port, advertised in the handshake.
    pub port: u16,
    /// URLs dialed at startup.
    pub seeds: Vec<String>,
}

impl Config {
    /// The URL this node advertises for itself.
    pub fn url(&self) -> String {
        connection::format_url(&self.host, self.port)
    }
}

/// Socket operations the host must supply. Calls are synchronous from the
/// node's perspective; completion (open, close, error) is reported back
/// through the node's `handle_*` methods.
pub trait Transport {
    /// Open an outbound connection to `url`, identified by `socket`.
    fn dial(&mut self, socket: &SocketId, url: &str) -> Result<(), Error>;

    /// Send one frame on `socket`.
    fn send(&mut self, socket: &SocketId, frame: Bytes) -> Result<(), Error>;

    /// Close `socket` with the given close code.
    fn close(&mut self, socket: &SocketId, code: u16);
}

/// Sink for decrypted chat messages. `from` is the authenticated id of the
/// directly connected sender.
pub trait Mailbox {
    fn deliver(&mut self, from: &PeerId, message: &str);
}
