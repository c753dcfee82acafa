//! Node identity and per-peer cryptography.
//!
//! Each node holds a long-term ed25519 signing keypair (authorship) and an
//! x25519 exchange keypair (key agreement). Completing a key exchange with a
//! peer derives a ChaCha20-Poly1305 key (SHA-256 of the raw shared secret)
//! that is cached per peer id until the peer's connection is removed.
//!
//! # Warning
//!
//! Signatures on a peer's first HANDSHAKE are verified against the signing
//! key embedded in that same message (first-trust bootstrap). This provides
//! no protection against a man-in-the-middle on the initial connection.

use crate::Error;
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use ed25519_consensus::{Signature, SigningKey, VerificationKey};
use rand::{CryptoRng, Rng};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    fmt::{Debug, Display},
};
use x25519_dalek::{PublicKey as ExchangePublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const PEER_ID_LENGTH: usize = 16;
const SIGNATURE_LENGTH: usize = 64;
const PUBLIC_KEY_LENGTH: usize = 32;
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Random token identifying a logical peer, distinct from any socket id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LENGTH]);

impl PeerId {
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R) -> Self {
        let mut raw = [0u8; PEER_ID_LENGTH];
        rng.fill_bytes(&mut raw);
        Self(raw)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let raw = hex::decode(hex).ok()?;
        let raw: [u8; PEER_ID_LENGTH] = raw.try_into().ok()?;
        Some(Self(raw))
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", hex::encode(self.0))
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).ok_or_else(|| serde::de::Error::custom("invalid peer id"))
    }
}

/// A node's long-term identity: random id, display name, signing keypair,
/// and exchange keypair. Generated once and immutable for the process life.
pub struct Identity {
    id: PeerId,
    name: String,
    signer: SigningKey,
    exchange: StaticSecret,
}

impl Identity {
    pub fn generate<R: Rng + CryptoRng>(rng: &mut R, name: &str) -> Self {
        Self {
            id: PeerId::generate(rng),
            name: name.to_string(),
            signer: SigningKey::new(&mut *rng),
            exchange: StaticSecret::random_from_rng(&mut *rng),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signing_public_key(&self) -> VerificationKey {
        self.signer.verification_key()
    }

    pub fn exchange_public_key(&self) -> ExchangePublicKey {
        ExchangePublicKey::from(&self.exchange)
    }
}

/// Ciphertext with the nonce and authentication tag required to open it.
///
/// All three fields travel together inside the envelope payload; decryption
/// is never attempted without the exact iv and tag produced at encryption.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sealed {
    #[serde(with = "hex::serde")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub iv: Vec<u8>,
    #[serde(with = "hex::serde")]
    pub auth_tag: Vec<u8>,
}

/// Symmetric key derived for one peer, scrubbed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
struct PeerSecret {
    key: [u8; KEY_SIZE],
    #[zeroize(skip)]
    exchange_public_key: ExchangePublicKey,
}

/// Performs all signing, verification, and authenticated encryption for a
/// node, caching one derived symmetric key per authenticated peer.
pub struct CryptoEngine {
    identity: Identity,
    secrets: HashMap<PeerId, PeerSecret>,
}

impl CryptoEngine {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            secrets: HashMap::new(),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Sign raw bytes with the node's private signing key.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LENGTH] {
        self.identity.signer.sign(message).to_bytes()
    }

    /// Verify a signature over raw bytes. Returns false on any malformed
    /// input; never errors.
    pub fn verify(message: &[u8], public_key: &VerificationKey, signature: &[u8]) -> bool {
        let raw: [u8; SIGNATURE_LENGTH] = match signature.try_into() {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        public_key.verify(&Signature::from(raw), message).is_ok()
    }

    /// Parse a wire-encoded ed25519 verification key.
    pub fn parse_signing_key(raw: &[u8]) -> Option<VerificationKey> {
        let raw: [u8; PUBLIC_KEY_LENGTH] = raw.try_into().ok()?;
        VerificationKey::try_from(raw).ok()
    }

    /// Parse a wire-encoded x25519 public key.
    pub fn parse_exchange_key(raw: &[u8]) -> Option<ExchangePublicKey> {
        let raw: [u8; PUBLIC_KEY_LENGTH] = raw.try_into().ok()?;
        Some(ExchangePublicKey::from(raw))
    }

    /// Derive and store the symmetric key for `peer` from our exchange
    /// private key and their exchange public key.
    ///
    /// Calling again for the same peer overwrites the stored secret (last
    /// call wins).
    pub fn begin_exchange(&mut self, peer: PeerId, exchange_public_key: &ExchangePublicKey) {
        let shared = self.identity.exchange.diffie_hellman(exchange_public_key);
        let mut digest = Sha256::new();
        digest.update(shared.as_bytes());
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest.finalize());
        self.secrets.insert(
            peer,
            PeerSecret {
                key,
                exchange_public_key: *exchange_public_key,
            },
        );
    }

    pub fn has_secret(&self, peer: &PeerId) -> bool {
        self.secrets.contains_key(peer)
    }

    /// Drop the stored secret for `peer`. Called when the peer's connection
    /// is removed from the registry.
    pub fn forget(&mut self, peer: &PeerId) {
        self.secrets.remove(peer);
    }

    /// Encrypt plaintext for `peer` with a fresh random nonce.
    pub fn encrypt<R: Rng + CryptoRng>(
        &self,
        rng: &mut R,
        peer: &PeerId,
        plaintext: &[u8],
    ) -> Result<Sealed, Error> {
        let secret = self.secrets.get(peer).ok_or(Error::HandshakeNotCompleted)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&secret.key));
        let mut iv = [0u8; NONCE_SIZE];
        rng.fill_bytes(&mut iv);
        let mut combined = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|_| Error::EncryptionFailed)?;
        let auth_tag = combined.split_off(combined.len() - TAG_SIZE);
        Ok(Sealed {
            ciphertext: combined,
            iv: iv.to_vec(),
            auth_tag,
        })
    }

    /// Decrypt a sealed payload from `peer`. Fails if the tag does not
    /// verify or the iv/tag are the wrong size.
    pub fn decrypt(&self, peer: &PeerId, sealed: &Sealed) -> Result<Vec<u8>, Error> {
        let secret = self.secrets.get(peer).ok_or(Error::HandshakeNotCompleted)?;
        if sealed.iv.len() != NONCE_SIZE || sealed.auth_tag.len() != TAG_SIZE {
            return Err(Error::DecryptionFailed);
        }
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&secret.key));
        let mut combined = Vec::with_capacity(sealed.ciphertext.len() + TAG_SIZE);
        combined.extend_from_slice(&sealed.ciphertext);
        combined.extend_from_slice(&sealed.auth_tag);
        cipher
            .decrypt(Nonce::from_slice(&sealed.iv), combined.as_ref())
            .map_err(|_| Error::DecryptionFailed)
    }

    /// The exchange public key recorded for `peer`, if a secret exists.
    pub fn peer_exchange_key(&self, peer: &PeerId) -> Option<ExchangePublicKey> {
        self.secrets.get(peer).map(|s| s.exchange_public_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    fn engines() -> (CryptoEngine, CryptoEngine, PeerId, PeerId) {
        let mut rng = StdRng::seed_from_u64(0);
        let a = CryptoEngine::new(Identity::generate(&mut rng, "alice"));
        let b = CryptoEngine::new(Identity::generate(&mut rng, "bob"));
        let a_id = a.identity().id();
        let b_id = b.identity().id();
        (a, b, a_id, b_id)
    }

    #[test]
    fn test_sign_verify() {
        let (a, _, _, _) = engines();
        let message = b"attested bytes";
        let signature = a.sign(message);
        let public_key = a.identity().signing_public_key();
        assert!(CryptoEngine::verify(message, &public_key, &signature));
        assert!(!CryptoEngine::verify(b"other bytes", &public_key, &signature));

        // Malformed signatures are false, never a panic or error.
        assert!(!CryptoEngine::verify(message, &public_key, &signature[..32]));
        assert!(!CryptoEngine::verify(message, &public_key, &[]));
        let mut tampered = signature;
        tampered[0] ^= 0xFF;
        assert!(!CryptoEngine::verify(message, &public_key, &tampered));
    }

    #[test]
    fn test_exchange_symmetry() {
        let (mut a, mut b, a_id, b_id) = engines();
        a.begin_exchange(b_id, &b.identity().exchange_public_key());
        b.begin_exchange(a_id, &a.identity().exchange_public_key());

        // Both sides derive the same key: what one seals the other opens.
        let mut rng = StdRng::seed_from_u64(1);
        let sealed = a.encrypt(&mut rng, &b_id, b"cross check").unwrap();
        assert_eq!(b.decrypt(&a_id, &sealed).unwrap(), b"cross check");
    }

    #[test]
    fn test_encrypt_round_trip() {
        let (mut a, b, _, b_id) = engines();
        a.begin_exchange(b_id, &b.identity().exchange_public_key());

        let mut rng = StdRng::seed_from_u64(2);
        for plaintext in [&b""[..], b"m", b"a longer plaintext with spaces"] {
            let sealed = a.encrypt(&mut rng, &b_id, plaintext).unwrap();
            assert_eq!(a.decrypt(&b_id, &sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let (mut a, b, _, b_id) = engines();
        a.begin_exchange(b_id, &b.identity().exchange_public_key());

        let mut rng = StdRng::seed_from_u64(3);
        let first = a.encrypt(&mut rng, &b_id, b"same plaintext").unwrap();
        let second = a.encrypt(&mut rng, &b_id, b"same plaintext").unwrap();
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (mut a, b, _, b_id) = engines();
        a.begin_exchange(b_id, &b.identity().exchange_public_key());

        let mut rng = StdRng::seed_from_u64(4);
        let sealed = a.encrypt(&mut rng, &b_id, b"integrity").unwrap();

        let mut bad_tag = sealed.clone();
        bad_tag.auth_tag[0] ^= 0xFF;
        assert!(matches!(
            a.decrypt(&b_id, &bad_tag),
            Err(Error::DecryptionFailed)
        ));

        let mut bad_iv = sealed.clone();
        bad_iv.iv[0] ^= 0xFF;
        assert!(matches!(
            a.decrypt(&b_id, &bad_iv),
            Err(Error::DecryptionFailed)
        ));

        let mut bad_ct = sealed;
        bad_ct.ciphertext[0] ^= 0xFF;
        assert!(matches!(
            a.decrypt(&b_id, &bad_ct),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_encrypt_requires_exchange() {
        let (a, _, _, b_id) = engines();
        let mut rng = StdRng::seed_from_u64(5);
        assert!(matches!(
            a.encrypt(&mut rng, &b_id, b"too early"),
            Err(Error::HandshakeNotCompleted)
        ));
        let sealed = Sealed {
            ciphertext: vec![0; 8],
            iv: vec![0; 12],
            auth_tag: vec![0; 16],
        };
        assert!(matches!(
            a.decrypt(&b_id, &sealed),
            Err(Error::HandshakeNotCompleted)
        ));
    }

    #[test]
    fn test_exchange_overwrites() {
        let (mut a, b, _, b_id) = engines();
        let mut rng = StdRng::seed_from_u64(6);
        a.begin_exchange(b_id, &b.identity().exchange_public_key());
        let stale = a.encrypt(&mut rng, &b_id, b"before rekey").unwrap();

        // Last call wins: a secret derived against a different exchange key
        // replaces the old one, so the old ciphertext no longer opens.
        let other = Identity::generate(&mut rng, "mallory");
        a.begin_exchange(b_id, &other.exchange_public_key());
        assert!(matches!(
            a.decrypt(&b_id, &stale),
            Err(Error::DecryptionFailed)
        ));
    }

    #[test]
    fn test_forget_invalidates() {
        let (mut a, b, _, b_id) = engines();
        a.begin_exchange(b_id, &b.identity().exchange_public_key());
        assert!(a.has_secret(&b_id));
        a.forget(&b_id);
        assert!(!a.has_secret(&b_id));
    }

    #[test]
    fn test_peer_id_hex() {
        let mut rng = StdRng::seed_from_u64(7);
        let id = PeerId::generate(&mut rng);
        let hex = id.to_string();
        assert_eq!(PeerId::from_hex(&hex), Some(id));
        assert_eq!(PeerId::from_hex("zz"), None);
        assert_eq!(PeerId::from_hex("abcd"), None); // wrong length
    }
}
