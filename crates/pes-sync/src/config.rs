use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timeouts for the sync barrier, in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Wait applied by callers that do not pass their own timeout.
    pub default_timeout_ms: u64,
    /// How long a finished token keeps answering `has_finish_sync` after
    /// its last lookup.
    pub finished_retention_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            finished_retention_ms: 5 * 60_000,
        }
    }
}

impl SyncConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::from_millis(self.finished_retention_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = SyncConfig::default();
        assert_eq!(c.default_timeout(), Duration::from_secs(60));
        assert_eq!(c.finished_retention(), Duration::from_secs(300));
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let c: SyncConfig = serde_json::from_str(r#"{"default_timeout_ms": 250}"#).unwrap();
        assert_eq!(c.default_timeout(), Duration::from_millis(250));
        assert_eq!(c.finished_retention_ms, 300_000);
    }
}
