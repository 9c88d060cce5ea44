use std::io;

use pes_chain::ChainError;
use pes_types::PartitionKey;

/// Errors produced by bridges and log backends.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Raised only when a partition is created.
    #[error("partition index {index} of topic '{topic}' exceeds the limit of {max} partitions")]
    Capacity { topic: String, index: u32, max: u32 },

    #[error("partition {0} has not been created")]
    UnknownPartition(PartitionKey),

    #[error("partition {0} is still fed from its backend")]
    FeederRunning(PartitionKey),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl BridgeError {
    /// Corruption stops a partition's feed for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Chain(ChainError::Corruption { .. }))
    }
}

/// Convenience alias used throughout the bridge crate.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;
