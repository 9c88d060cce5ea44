/// Domain-separated BLAKE3 hasher.
///
/// Each hasher carries a domain tag that is prepended to every hash
/// computation, so a key hash and an entry digest over identical bytes never
/// collide.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for public-key identifiers.
    pub const PUBLIC_KEY: Self = Self {
        domain: "pes-public-key-v1",
    };
    /// Hasher for the bytes an entry author signs.
    pub const ENTRY: Self = Self {
        domain: "pes-entry-v1",
    };

    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        *hasher.finalize().as_bytes()
    }

    /// Hash the canonical bincode encoding of a value.
    pub fn hash_canonical<T: serde::Serialize>(&self, value: &T) -> Result<[u8; 32], HasherError> {
        let data =
            bincode::serialize(value).map_err(|e| HasherError::Serialization(e.to_string()))?;
        Ok(self.hash(&data))
    }

    pub fn domain(&self) -> &str {
        self.domain
    }
}

/// Errors from hashing operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HasherError {
    #[error("serialization error: {0}")]
    Serialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domains_separate_identical_input() {
        let data = b"same bytes";
        assert_ne!(
            ContentHasher::PUBLIC_KEY.hash(data),
            ContentHasher::ENTRY.hash(data)
        );
    }

    #[test]
    fn hash_is_deterministic() {
        let h = ContentHasher::new("test");
        assert_eq!(h.hash(b"abc"), h.hash(b"abc"));
        assert_eq!(h.domain(), "test");
    }

    #[test]
    fn canonical_hash_tracks_value() {
        let h = ContentHasher::ENTRY;
        let a = h.hash_canonical(&(1u32, "x")).unwrap();
        let b = h.hash_canonical(&(1u32, "x")).unwrap();
        let c = h.hash_canonical(&(2u32, "x")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
