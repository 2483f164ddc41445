//! Local store configuration.

use serde::{Deserialize, Serialize};

/// What a local update does to an already-synced record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePolicy {
    /// Every update flags the record pending again so the edit reaches the mirror.
    #[default]
    MarkPending,
    /// Updates leave the sync flag untouched; edits to synced records stay local.
    KeepSyncFlag,
}

/// Configuration for the local store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Sync flag handling on update.
    pub update_policy: UpdatePolicy,
    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            update_policy: UpdatePolicy::MarkPending,
            busy_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{ "update_policy": "keep_sync_flag" }"#).unwrap();
        assert_eq!(config.update_policy, UpdatePolicy::KeepSyncFlag);
        assert_eq!(config.busy_timeout_ms, 5_000);
    }
}
