use pes_types::KeyHash;
use serde::{Deserialize, Serialize};

use crate::hasher::ContentHasher;

/// Private half of an author key. Only the owning writer holds one.
pub struct SigningKey(ed25519_dalek::SigningKey);

/// Public half of an author key, as announced on a partition.
#[derive(Clone, PartialEq, Eq)]
pub struct VerifyingKey(ed25519_dalek::VerifyingKey);

/// Detached Ed25519 signature over an entry digest.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_bytes")] ed25519_dalek::Signature);

/// Produces signatures on behalf of one key.
///
/// The store never sees private key material directly; writers hand it a
/// `Signer`, and entries record only the [`KeyHash`] of the signing key.
pub trait Signer: Send + Sync {
    fn key_hash(&self) -> KeyHash;

    fn sign(&self, message: &[u8]) -> Signature;
}

impl SigningKey {
    pub fn generate() -> Self {
        Self(ed25519_dalek::SigningKey::generate(&mut rand::thread_rng()))
    }

    /// Rebuild a key from its 32 secret bytes (as printed by `pes keygen`).
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&secret))
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.0.verifying_key())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self::from_bytes(*self.as_bytes())
    }
}

impl Signer for SigningKey {
    fn key_hash(&self) -> KeyHash {
        self.verifying_key().key_hash()
    }

    fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer as _;
        Signature(self.0.sign(message))
    }
}

impl VerifyingKey {
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        use ed25519_dalek::Verifier as _;
        self.0
            .verify(message, &signature.0)
            .map_err(|_| SignatureError::InvalidSignature)
    }

    /// Hash identifying this key in rights sets and log entries.
    pub fn key_hash(&self) -> KeyHash {
        KeyHash::from_bytes(ContentHasher::PUBLIC_KEY.hash(self.0.as_bytes()))
    }

    pub fn as_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Parse an announced key. Bytes that are not a curve point are rejected.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, SignatureError> {
        ed25519_dalek::VerifyingKey::from_bytes(&bytes)
            .map(Self)
            .map_err(|_| SignatureError::InvalidKey)
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey(<redacted> {})", self.key_hash().short_id())
    }
}

impl std::fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VerifyingKey({})", self.key_hash().short_id())
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bytes = self.0.to_bytes();
        write!(f, "Signature({}..)", hex::encode(&bytes[..6]))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature does not match message and key")]
    InvalidSignature,
    #[error("bytes are not a valid ed25519 public key")]
    InvalidKey,
}

/// Signatures travel as a 64-byte string inside entry bodies.
mod signature_bytes {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(sig: &ed25519_dalek::Signature, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(&sig.to_bytes())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ed25519_dalek::Signature, D::Error> {
        let raw = Vec::<u8>::deserialize(d)?;
        let bytes: [u8; 64] = raw
            .as_slice()
            .try_into()
            .map_err(|_| D::Error::invalid_length(raw.len(), &"64 signature bytes"))?;
        Ok(ed25519_dalek::Signature::from_bytes(&bytes))
    }
}
