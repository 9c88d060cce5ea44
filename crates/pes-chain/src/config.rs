use serde::{Deserialize, Serialize};

use crate::merge::MergePolicy;

/// Configuration for partition chains.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// Conflict resolution used when a write does not extend the current head.
    pub merge_policy: MergePolicy,
}
