use std::path::Path;

use pes_bridge::{BackendConfig, BridgeConfig};
use pes_chain::ChainConfig;
use pes_sync::SyncConfig;
use serde::{Deserialize, Serialize};

use crate::error::{IoError, IoResult};

/// Sizes of the pipeline's own layers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Objects held by the cache layer before the oldest is evicted.
    pub cache_capacity: usize,
    /// Decisions retained in memory by the access-log layer.
    pub access_log_capacity: usize,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            access_log_capacity: 4096,
        }
    }
}

/// Everything needed to open a [`Store`](crate::Store).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Node id stamped into every timestamp this store writes.
    pub node_id: u16,
    pub bridge: BridgeConfig,
    pub sync: SyncConfig,
    pub io: IoConfig,
    pub chain: ChainConfig,
    pub backend: BackendConfig,
}

impl StoreConfig {
    pub fn from_toml_str(text: &str) -> IoResult<Self> {
        toml::from_str(text).map_err(|e| IoError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> IoResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> IoResult<String> {
        toml::to_string_pretty(self).map_err(|e| IoError::Config(e.to_string()))
    }
}
