//! Sync service configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the sync service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Push a record right after a local write when online.
    ///
    /// Purely an optimisation: pending records are always picked up by the
    /// next triggered run.
    pub immediate_push: bool,
    /// Buffered run outcomes per subscriber before the oldest are dropped.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            immediate_push: true,
            event_capacity: 16,
        }
    }
}
