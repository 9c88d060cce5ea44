use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Partition lifecycle settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Partition indices must stay below this bound.
    pub max_partitions_per_topic: u32,
    /// Live records buffered per subscriber before it has to re-read.
    pub channel_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_partitions_per_topic: 128,
            channel_capacity: 1024,
        }
    }
}

/// Which log backend a store runs on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    #[default]
    Memory,
    File {
        root: PathBuf,
        /// `fsync` after every append.
        #[serde(default)]
        sync_every_write: bool,
    },
}
