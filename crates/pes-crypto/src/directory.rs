use std::collections::HashMap;
use std::sync::RwLock;

use pes_types::KeyHash;

use crate::signer::{Signature, VerifyingKey};

/// Resolves key hashes to public keys and checks signatures against them.
pub trait Verifier: Send + Sync {
    fn public_key_for_hash(&self, hash: &KeyHash) -> Option<VerifyingKey>;

    /// `true` only if the key is known and the signature is valid for it.
    fn verify(&self, message: &[u8], signature: &Signature, hash: &KeyHash) -> bool {
        self.public_key_for_hash(hash)
            .map(|key| key.verify(message, signature).is_ok())
            .unwrap_or(false)
    }
}

/// In-memory public key directory.
///
/// Keys arrive either up front (registered by the embedding application) or
/// late, when a public-key announcement is replayed from a partition log.
#[derive(Default)]
pub struct KeyDirectory {
    keys: RwLock<HashMap<KeyHash, VerifyingKey>>,
}

impl KeyDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key. Returns its hash and whether it was previously unknown.
    pub fn register(&self, key: VerifyingKey) -> (KeyHash, bool) {
        let hash = key.key_hash();
        let mut keys = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let inserted = keys.insert(hash, key).is_none();
        (hash, inserted)
    }

    pub fn contains(&self, hash: &KeyHash) -> bool {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Verifier for KeyDirectory {
    fn public_key_for_hash(&self, hash: &KeyHash) -> Option<VerifyingKey> {
        self.keys
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hash)
            .cloned()
    }
}

impl std::fmt::Debug for KeyDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyDirectory")
            .field("key_count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{Signer, SigningKey};

    #[test]
    fn unknown_key_never_verifies() {
        let dir = KeyDirectory::new();
        let sk = SigningKey::generate();
        let sig = sk.sign(b"payload");
        assert!(!dir.verify(b"payload", &sig, &sk.key_hash()));
    }

    #[test]
    fn registered_key_verifies() {
        let dir = KeyDirectory::new();
        let sk = SigningKey::generate();
        let (hash, fresh) = dir.register(sk.verifying_key());
        assert!(fresh);
        assert_eq!(hash, sk.key_hash());

        let sig = sk.sign(b"payload");
        assert!(dir.verify(b"payload", &sig, &hash));
        assert!(!dir.verify(b"tampered", &sig, &hash));
    }

    #[test]
    fn re_registering_is_not_fresh() {
        let dir = KeyDirectory::new();
        let sk = SigningKey::generate();
        dir.register(sk.verifying_key());
        let (_, fresh) = dir.register(sk.verifying_key());
        assert!(!fresh);
        assert_eq!(dir.len(), 1);
    }
}
