use std::collections::{BTreeSet, HashMap};

use pes_types::KeyHash;

use crate::signer::{Signer, SigningKey};

/// The private keys a caller holds.
///
/// Holding a private key is what grants read access to entities listing its
/// hash in their read keys, and write access where listed in write keys.
#[derive(Clone, Default)]
pub struct Keychain {
    keys: HashMap<KeyHash, SigningKey>,
}

impl Keychain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: SigningKey) -> Self {
        self.add(key);
        self
    }

    pub fn add(&mut self, key: SigningKey) -> KeyHash {
        let hash = key.key_hash();
        self.keys.insert(hash, key);
        hash
    }

    pub fn holds(&self, hash: &KeyHash) -> bool {
        self.keys.contains_key(hash)
    }

    /// `true` if any held key appears in `allowed`.
    pub fn holds_any(&self, allowed: &BTreeSet<KeyHash>) -> bool {
        allowed.iter().any(|hash| self.keys.contains_key(hash))
    }

    /// First held key (in hash order) that appears in `allowed`.
    pub fn signer_for(&self, allowed: &BTreeSet<KeyHash>) -> Option<&SigningKey> {
        allowed.iter().find_map(|hash| self.keys.get(hash))
    }

    pub fn get(&self, hash: &KeyHash) -> Option<&SigningKey> {
        self.keys.get(hash)
    }

    pub fn key_hashes(&self) -> BTreeSet<KeyHash> {
        self.keys.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl std::fmt::Debug for Keychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keychain")
            .field("keys", &self.key_hashes())
            .finish()
    }
}
