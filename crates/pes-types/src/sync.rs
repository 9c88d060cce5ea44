use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Random correlation id that follows one write through asynchronous replay.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncToken {
    pub high: i64,
    pub low: i64,
}

impl SyncToken {
    pub fn new(high: i64, low: i64) -> Self {
        Self { high, low }
    }

    /// Fresh random token.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            high: rng.gen(),
            low: rng.gen(),
        }
    }
}

impl fmt::Debug for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SyncToken({self})")
    }
}

impl fmt::Display for SyncToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high as u64, self.low as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_tokens_differ() {
        assert_ne!(SyncToken::random(), SyncToken::random());
    }

    #[test]
    fn display_is_fixed_width_hex() {
        let token = SyncToken::new(-1, 1);
        assert_eq!(token.to_string(), "ffffffffffffffff0000000000000001");
    }
}
