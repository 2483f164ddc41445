//! OcuScan Sync Engine
//!
//! This module mirrors pending local records to the remote backend:
//! - Connectivity monitor driven by the platform's reachability signal
//! - Per-entity push workers with per-record failure isolation
//! - Single-flight orchestrator running users, patients, then scans
//! - Sync service wiring startup and reconnects to sync runs

pub mod config;
pub mod connectivity;
pub mod orchestrator;
pub mod report;
pub mod service;
pub mod worker;

// Re-export main types
pub use config::SyncConfig;
pub use connectivity::{ConnectivityMonitor, Subscription};
pub use orchestrator::{OrchestratorState, SyncOrchestrator};
pub use report::{KindReport, RunReport, SyncOutcome, Trigger};
pub use service::SyncService;
pub use worker::{push_record, EntityWorker};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_exports() {
        // Verify all main types are accessible
        let _config = SyncConfig::default();
        let _monitor = ConnectivityMonitor::new(false);
        let _report = KindReport::new(ocuscan_common::EntityKind::Scan);
    }
}
