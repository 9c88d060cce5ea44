use pes_types::{EntityId, EntryId, KeyHash, PartitionKey};

/// Why an entry failed rights validation. Such entries are quarantined,
/// never merged.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RightsError {
    #[error("author key {0} is not known")]
    UnknownKey(KeyHash),

    #[error("signature by {author} does not verify")]
    BadSignature { author: KeyHash },

    #[error("key {author} may not write entity {entity}")]
    NotAuthorized { author: KeyHash, entity: EntityId },

    #[error("parent entity {parent} does not exist")]
    MissingParent { parent: EntityId },

    #[error("parent type '{parent_type}' may not own type '{child_type}'")]
    ParentTypeNotAllowed {
        parent_type: String,
        child_type: String,
    },
}

impl RightsError {
    /// The key whose later discovery would make the entry worth retrying.
    pub fn retry_key(&self) -> Option<KeyHash> {
        match self {
            Self::UnknownKey(hash) => Some(*hash),
            _ => None,
        }
    }
}

/// Errors produced by chain operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// Offset ordering was violated; fatal for the partition's feed.
    #[error("corruption in {partition} at offset {offset}: {reason}")]
    Corruption {
        partition: PartitionKey,
        offset: u64,
        reason: String,
    },

    #[error("rights violation: {0}")]
    Rights(#[from] RightsError),

    /// Only raised under `MergePolicy::FailOnConflict`.
    #[error("merge conflict on entity {entity} (entry {entry}): field '{field}'")]
    MergeConflict {
        entity: EntityId,
        entry: EntryId,
        field: String,
    },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("chain lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout the chain crate.
pub type ChainResult<T> = std::result::Result<T, ChainError>;
