use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Names one independently-ordered append log: a topic plus a partition index.
///
/// The upper bound on `index` is a deployment constant enforced when the
/// partition is created, never when it is written to.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub topic: String,
    pub index: u32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, index: u32) -> Self {
        Self {
            topic: topic.into(),
            index,
        }
    }

    /// File-system safe name, e.g. `accounts-3`.
    pub fn file_stem(&self) -> String {
        let topic: String = self
            .topic
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        format!("{topic}-{}", self.index)
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionKey({}:{})", self.topic, self.index)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.index)
    }
}

impl FromStr for PartitionKey {
    type Err = TypeError;

    /// Parses the `topic:index` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (topic, index) = s
            .rsplit_once(':')
            .ok_or_else(|| TypeError::InvalidPartitionKey(s.to_string()))?;
        if topic.is_empty() {
            return Err(TypeError::InvalidPartitionKey(s.to_string()));
        }
        let index = index
            .parse()
            .map_err(|_| TypeError::InvalidPartitionKey(s.to_string()))?;
        Ok(Self::new(topic, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_parse_roundtrip() {
        let key = PartitionKey::new("accounts", 3);
        assert_eq!(key.to_string(), "accounts:3");
        assert_eq!("accounts:3".parse::<PartitionKey>().unwrap(), key);
    }

    #[test]
    fn parse_rejects_malformed_keys() {
        assert!("accounts".parse::<PartitionKey>().is_err());
        assert!(":3".parse::<PartitionKey>().is_err());
        assert!("accounts:x".parse::<PartitionKey>().is_err());
    }

    #[test]
    fn file_stem_sanitizes_topic() {
        let key = PartitionKey::new("bank/ledger.v1", 0);
        assert_eq!(key.file_stem(), "bank_ledger_v1-0");
    }
}
