//! Sync run triggers, per-kind tallies and run outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use ocuscan_common::EntityKind;

/// What asked for a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// Application start.
    Startup,
    /// The connectivity monitor reported an offline to online transition.
    Reconnect,
    /// Explicit user or operator request.
    Manual,
}

/// Tally of one entity kind's pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindReport {
    pub kind: EntityKind,
    /// Pending records a push was attempted for.
    pub attempted: usize,
    /// Records pushed and flagged synced.
    pub synced: usize,
    /// Records whose push failed; they stay pending.
    pub failed: usize,
    /// Records skipped because the mirror required authentication.
    pub auth_skipped: usize,
    /// Records pushed but edited locally during the push; they stay pending.
    pub stale: usize,
}

impl KindReport {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            attempted: 0,
            synced: 0,
            failed: 0,
            auth_skipped: 0,
            stale: 0,
        }
    }
}

/// Result of one pass over all entity kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    /// Per-kind tallies in the order the kinds ran.
    pub kinds: Vec<KindReport>,
    /// Set when a local store failure ended the run early.
    pub aborted: Option<String>,
}

impl RunReport {
    pub fn kind(&self, kind: EntityKind) -> Option<&KindReport> {
        self.kinds.iter().find(|k| k.kind == kind)
    }

    pub fn attempted(&self) -> usize {
        self.kinds.iter().map(|k| k.attempted).sum()
    }

    pub fn synced(&self) -> usize {
        self.kinds.iter().map(|k| k.synced).sum()
    }

    /// Failed pushes, auth skips included.
    pub fn failed(&self) -> usize {
        self.kinds.iter().map(|k| k.failed + k.auth_skipped).sum()
    }

    /// Every attempted record ended up synced.
    pub fn is_clean(&self) -> bool {
        self.aborted.is_none() && self.synced() == self.attempted()
    }
}

/// What a sync request did.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// A run was already in flight; the request was dropped.
    Busy,
    /// The device was offline; no worker ran.
    Offline,
    /// The run went through every entity kind.
    Completed(RunReport),
    /// A local store failure ended the run early.
    Aborted(RunReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            SyncOutcome::Completed(report) | SyncOutcome::Aborted(report) => Some(report),
            SyncOutcome::Busy | SyncOutcome::Offline => None,
        }
    }

    /// Whether any worker ran.
    pub fn ran(&self) -> bool {
        self.report().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_totals() {
        let mut users = KindReport::new(EntityKind::User);
        users.attempted = 1;
        users.synced = 1;
        let mut patients = KindReport::new(EntityKind::Patient);
        patients.attempted = 3;
        patients.synced = 1;
        patients.failed = 1;
        patients.auth_skipped = 1;

        let report = RunReport {
            trigger: Trigger::Manual,
            started_at: Utc::now(),
            duration: Duration::from_millis(5),
            kinds: vec![users, patients],
            aborted: None,
        };
        assert_eq!(report.attempted(), 4);
        assert_eq!(report.synced(), 2);
        assert_eq!(report.failed(), 2);
        assert!(!report.is_clean());
        assert_eq!(report.kind(EntityKind::Patient).map(|k| k.failed), Some(1));
        assert!(report.kind(EntityKind::Scan).is_none());

        let outcome = SyncOutcome::Completed(report);
        assert!(outcome.ran());
        assert!(!SyncOutcome::Busy.ran());
    }
}
