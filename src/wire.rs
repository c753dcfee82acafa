//! Wire envelope and command payloads.
//!
//! The outer envelope is hex-encoded JSON for transport compatibility:
//! `{"message": "<hex>", "signature": "<hex>"}`, where `message` decodes to
//! a command payload `{"command": <int>, "data": {...}}`. Before a peer is
//! READY the data object is signed plaintext; after READY it is the sealed
//! form carrying `ciphertext`/`iv`/`auth_tag` around the true data object.

use crate::{crypto::PeerId, Error};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Display;

/// Commands carried inside the envelope, identified on the wire by stable
/// small integers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Handshake = 0,
    HandshakeVerification = 1,
    HandshakeAck = 2,
    GetPeers = 3,
    GetPeersResponse = 4,
    AnnouncePeer = 5,
    SendMessage = 6,
}

impl Command {
    fn from_wire(value: u64) -> Option<Self> {
        match value {
            0 => Some(Self::Handshake),
            1 => Some(Self::HandshakeVerification),
            2 => Some(Self::HandshakeAck),
            3 => Some(Self::GetPeers),
            4 => Some(Self::GetPeersResponse),
            5 => Some(Self::AnnouncePeer),
            6 => Some(Self::SendMessage),
            _ => None,
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Handshake => "HANDSHAKE",
            Self::HandshakeVerification => "HANDSHAKE_VERIFICATION",
            Self::HandshakeAck => "HANDSHAKE_ACK",
            Self::GetPeers => "GET_PEERS",
            Self::GetPeersResponse => "GET_PEERS_RESPONSE",
            Self::AnnouncePeer => "ANNOUNCE_PEER",
            Self::SendMessage => "SEND_MESSAGE",
        };
        write!(f, "{}", name)
    }
}

/// Outer wire envelope: the serialized payload plus a signature over those
/// exact bytes.
#[derive(Serialize, Deserialize)]
pub struct Envelope {
    #[serde(with = "hex::serde")]
    pub message: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub signature: Vec<u8>,
}

impl Envelope {
    pub fn new(message: Vec<u8>, signature: &[u8]) -> Self {
        Self {
            message,
            signature: signature.to_vec(),
        }
    }

    pub fn encode(&self) -> Bytes {
        // Serialization of two hex strings cannot fail.
        serde_json::to_vec(self).unwrap_or_default().into()
    }

    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(frame)?)
    }
}

/// A decoded command payload. `data` is kept as a raw JSON object and
/// interpreted per command (and, post-READY, only after decryption).
#[derive(Debug)]
pub struct Payload {
    pub command: Command,
    pub data: Value,
}

impl Payload {
    pub fn new<T: Serialize>(command: Command, data: &T) -> Result<Self, Error> {
        Ok(Self {
            command,
            data: serde_json::to_value(data)?,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let raw = serde_json::json!({
            "command": self.command as u8,
            "data": self.data,
        });
        // A JSON value with string keys always serializes.
        serde_json::to_vec(&raw).unwrap_or_default()
    }

    /// Decode and validate a payload.
    ///
    /// Rejects non-object payloads, missing or non-numeric or unknown
    /// commands, `data` that is not an object (arrays included), and any
    /// payload reporting `"success": false`, which is an application-level
    /// error report to be logged and dropped rather than dispatched.
    pub fn decode(message: &[u8]) -> Result<Self, Error> {
        let raw: Value = serde_json::from_slice(message)?;
        let Some(fields) = raw.as_object() else {
            return Err(Error::PayloadNotObject);
        };
        let command = fields
            .get("command")
            .and_then(Value::as_u64)
            .ok_or(Error::MissingCommand)?;
        let command = Command::from_wire(command).ok_or(Error::UnknownCommand(command))?;
        let data = fields.get("data").cloned().unwrap_or(Value::Null);
        if !data.is_object() {
            return Err(Error::DataNotObject);
        }
        if data.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(Error::PeerReportedFailure);
        }
        Ok(Self { command, data })
    }

    /// Interpret `data` as the typed object for this command.
    pub fn data<T: for<'de> Deserialize<'de>>(&self) -> Result<T, Error> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// Contents of a HANDSHAKE: the sender's full identity card plus the port
/// its own listener is reachable on.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HandshakeData {
    pub id: PeerId,
    pub name: String,
    pub port: u16,
    #[serde(with = "hex::serde")]
    pub signing_public_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub exchange_public_key: Vec<u8>,
}

/// Contents of a HANDSHAKE_ACK.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AckData {
    pub success: bool,
}

/// One gossiped peer: everything needed to dial it and verify who answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub url: String,
    pub id: PeerId,
    #[serde(with = "hex::serde")]
    pub signing_public_key: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub exchange_public_key: Vec<u8>,
}

/// Contents of a GET_PEERS_RESPONSE.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeersData {
    pub peers: Vec<PeerDescriptor>,
}

/// Contents of a SEND_MESSAGE: one chat line and the id of its author.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatData {
    pub message: String,
    pub from: PeerId,
}
