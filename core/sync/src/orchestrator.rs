//! Single-flight sync orchestrator.
//!
//! Runs the entity workers in dependency order: users, then patients, then
//! scans. At most one run is in flight; a request that arrives while a run
//! is in progress is dropped, not queued.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ocuscan_common::{EntityKind, Record, Result};
use ocuscan_mirror::RemoteMirror;
use ocuscan_store::LocalStore;

use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::report::{RunReport, SyncOutcome, Trigger};
use crate::worker::{push_record, EntityWorker};

/// Whether a run is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Running,
}

/// Holds the running flag for the lifetime of one run.
///
/// Dropping the guard returns the orchestrator to idle, including when the
/// run future is cancelled or a worker panics.
struct RunGuard<'a> {
    running: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(running: &'a AtomicBool) -> Option<Self> {
        running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { running })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Coordinates sync runs over the local store and the remote mirror.
pub struct SyncOrchestrator {
    store: LocalStore,
    mirror: Arc<dyn RemoteMirror>,
    monitor: ConnectivityMonitor,
    running: AtomicBool,
    runs_completed: AtomicU64,
    last_report: Mutex<Option<RunReport>>,
    events: broadcast::Sender<SyncOutcome>,
}

impl SyncOrchestrator {
    pub fn new(
        store: LocalStore,
        mirror: Arc<dyn RemoteMirror>,
        monitor: ConnectivityMonitor,
        config: &SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store,
            mirror,
            monitor,
            running: AtomicBool::new(false),
            runs_completed: AtomicU64::new(0),
            last_report: Mutex::new(None),
            events,
        }
    }

    pub fn state(&self) -> OrchestratorState {
        if self.running.load(Ordering::Acquire) {
            OrchestratorState::Running
        } else {
            OrchestratorState::Idle
        }
    }

    /// Request a sync run.
    ///
    /// Returns `Busy` without doing anything if a run is already in flight,
    /// and `Offline` without touching the mirror if the device is offline.
    /// Otherwise every entity kind is pushed in order; a local store failure
    /// ends the run early with `Aborted`. Remote failures never end a run.
    pub async fn request_sync(&self, trigger: Trigger) -> SyncOutcome {
        let Some(guard) = RunGuard::acquire(&self.running) else {
            info!("Sync already running, dropping {:?} request", trigger);
            return SyncOutcome::Busy;
        };

        if !self.monitor.currently_online() {
            drop(guard);
            info!("Offline, skipping {:?} sync", trigger);
            self.emit(SyncOutcome::Offline);
            return SyncOutcome::Offline;
        }

        info!("Starting sync ({:?})", trigger);
        let report = self.run(trigger).await;
        drop(guard);

        info!(
            "Sync finished in {:?}: {} synced, {} failed of {} attempted",
            report.duration,
            report.synced(),
            report.failed(),
            report.attempted()
        );

        let outcome = if report.aborted.is_some() {
            SyncOutcome::Aborted(report.clone())
        } else {
            SyncOutcome::Completed(report.clone())
        };

        self.runs_completed.fetch_add(1, Ordering::AcqRel);
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report);
        self.emit(outcome.clone());
        outcome
    }

    /// Request a run on `runtime` without waiting for it.
    ///
    /// For callers outside async context, such as connectivity listeners.
    pub fn spawn_request(
        self: &Arc<Self>,
        runtime: &Handle,
        trigger: Trigger,
    ) -> JoinHandle<SyncOutcome> {
        let orchestrator = Arc::clone(self);
        runtime.spawn(async move { orchestrator.request_sync(trigger).await })
    }

    async fn run(&self, trigger: Trigger) -> RunReport {
        let started_at = Utc::now();
        let clock = Instant::now();
        let mut report = RunReport {
            trigger,
            started_at,
            duration: Duration::ZERO,
            kinds: Vec::with_capacity(EntityKind::SYNC_ORDER.len()),
            aborted: None,
        };

        for kind in EntityKind::SYNC_ORDER {
            match EntityWorker::new(kind, &self.store, self.mirror.as_ref())
                .run()
                .await
            {
                Ok(kind_report) => {
                    debug!(
                        "{}: {} synced, {} failed, {} skipped, {} stale",
                        kind,
                        kind_report.synced,
                        kind_report.failed,
                        kind_report.auth_skipped,
                        kind_report.stale
                    );
                    report.kinds.push(kind_report);
                }
                Err(e) => {
                    error!("Local store failure during {} sync: {}", kind, e);
                    report.aborted = Some(e.to_string());
                    break;
                }
            }
        }

        report.duration = clock.elapsed();
        report
    }

    /// Push a single record right away, outside the run cycle.
    ///
    /// Returns whether the record ended up synced. Remote failures are logged
    /// and leave the record pending for the next run.
    ///
    /// # Errors
    /// - Local store failures
    pub async fn push_now(&self, record: &Record) -> Result<bool> {
        if !self.monitor.currently_online() || !record.sync().is_pending() {
            return Ok(false);
        }

        let owner = match record.kind() {
            EntityKind::User => None,
            EntityKind::Patient | EntityKind::Scan => match self.mirror.identity().await {
                Ok(identity) => identity,
                Err(e) => {
                    debug!("Could not resolve remote identity: {}", e);
                    None
                }
            },
        };

        match push_record(self.mirror.as_ref(), record, owner.as_ref()).await {
            Ok(_) => self
                .store
                .mark_synced_if_current(record.kind(), record.id(), record.revision()),
            Err(e) => {
                warn!(
                    "Immediate push of {} {} failed, left for next sync: {}",
                    record.kind(),
                    record.id(),
                    e
                );
                Ok(false)
            }
        }
    }

    /// Receive the outcome of every run that was not dropped as busy.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncOutcome> {
        self.events.subscribe()
    }

    /// Number of runs that reached the workers.
    pub fn runs_completed(&self) -> u64 {
        self.runs_completed.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> Option<RunReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        &self.monitor
    }

    pub fn mirror(&self) -> &Arc<dyn RemoteMirror> {
        &self.mirror
    }

    fn emit(&self, outcome: SyncOutcome) {
        // No subscribers is fine.
        let _ = self.events.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocuscan_common::{NewPatient, NewScan, NewUser, PatientUpdate, Secret, SyncFlag};
    use ocuscan_mirror::{MemoryMirror, MirrorCall};
    use ocuscan_store::StoreConfig;

    struct Harness {
        store: LocalStore,
        mirror: MemoryMirror,
        monitor: ConnectivityMonitor,
        orchestrator: Arc<SyncOrchestrator>,
    }

    fn harness(online: bool) -> Harness {
        let store = LocalStore::in_memory(StoreConfig::default()).unwrap();
        let mirror = MemoryMirror::new();
        let monitor = ConnectivityMonitor::new(online);
        let remote: Arc<dyn RemoteMirror> = Arc::new(mirror.clone());
        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            remote,
            monitor.clone(),
            &SyncConfig::default(),
        ));
        Harness {
            store,
            mirror,
            monitor,
            orchestrator,
        }
    }

    fn add_patient(store: &LocalStore, record_number: &str) -> ocuscan_common::Patient {
        store
            .create_patient(&NewPatient::new(record_number, "Jane Doe", "").unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_offline_request_touches_nothing() {
        let h = harness(false);
        add_patient(&h.store, "A100");

        let outcome = h.orchestrator.request_sync(Trigger::Manual).await;

        assert!(matches!(outcome, SyncOutcome::Offline));
        assert!(h.mirror.calls().is_empty());
        assert_eq!(h.orchestrator.runs_completed(), 0);
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
        assert_eq!(h.store.pending_count(EntityKind::Patient).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_runs_kinds_in_dependency_order() {
        let h = harness(true);
        h.store
            .create_user(
                &NewUser::new("doc@clinic.org", Secret::new("pw"), "Dr. Grey", "", "doctor")
                    .unwrap(),
            )
            .unwrap();
        let patient = add_patient(&h.store, "A100");
        let scan = h
            .store
            .create_scan(&NewScan::new(patient.id, "file:///a.jpg", None, None).unwrap())
            .unwrap();

        let outcome = h.orchestrator.request_sync(Trigger::Startup).await;
        let report = outcome.report().unwrap();
        assert!(report.is_clean());
        assert_eq!(report.synced(), 3);

        let sync_key = scan.sync_key.to_string();
        assert_eq!(
            h.mirror.calls(),
            vec![
                MirrorCall::EnsureAccount {
                    email: "doc@clinic.org".to_string()
                },
                MirrorCall::Upsert {
                    kind: EntityKind::User,
                    natural_key: "doc@clinic.org".to_string()
                },
                MirrorCall::Identity,
                MirrorCall::Upsert {
                    kind: EntityKind::Patient,
                    natural_key: "A100".to_string()
                },
                MirrorCall::Identity,
                MirrorCall::Upsert {
                    kind: EntityKind::Scan,
                    natural_key: sync_key.clone()
                },
            ]
        );

        // The scan carries the account created earlier in the same run.
        let account = h.mirror.account("doc@clinic.org").unwrap();
        let remote_scan = h.mirror.get(EntityKind::Scan, &sync_key).unwrap();
        assert_eq!(remote_scan.owner, Some(account.user_id));
        for status in h.store.status().unwrap() {
            assert_eq!(status.pending, 0);
        }
    }

    #[tokio::test]
    async fn test_at_most_one_run_in_flight() {
        let h = harness(true);
        add_patient(&h.store, "A100");
        h.mirror.hold_upserts();

        let first = {
            let orchestrator = h.orchestrator.clone();
            tokio::spawn(async move { orchestrator.request_sync(Trigger::Startup).await })
        };

        // Identity lookup, then the held patient upsert
        h.mirror.wait_for_calls(2).await;
        assert_eq!(h.orchestrator.state(), OrchestratorState::Running);

        let second = h.orchestrator.request_sync(Trigger::Reconnect).await;
        assert!(matches!(second, SyncOutcome::Busy));

        h.mirror.release_upserts();
        let first = first.await.unwrap();
        assert!(matches!(first, SyncOutcome::Completed(_)));
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
        assert_eq!(h.orchestrator.runs_completed(), 1);
        assert_eq!(h.mirror.upserts(EntityKind::Patient), vec!["A100"]);
    }

    #[tokio::test]
    async fn test_store_failure_aborts_and_returns_to_idle() {
        let h = harness(true);
        let mut events = h.orchestrator.subscribe();
        h.store.close();

        let outcome = h.orchestrator.request_sync(Trigger::Manual).await;

        let report = match outcome {
            SyncOutcome::Aborted(report) => report,
            other => panic!("expected aborted run, got {:?}", other),
        };
        assert!(report.aborted.is_some());
        assert!(report.kinds.is_empty());
        assert_eq!(h.orchestrator.state(), OrchestratorState::Idle);
        assert!(matches!(events.recv().await.unwrap(), SyncOutcome::Aborted(_)));
    }

    #[tokio::test]
    async fn test_unavailable_mirror_keeps_records_pending() {
        let h = harness(true);
        add_patient(&h.store, "A100");
        add_patient(&h.store, "A101");
        h.mirror.set_unavailable(true);

        let outcome = h.orchestrator.request_sync(Trigger::Manual).await;
        let report = outcome.report().unwrap();
        assert!(matches!(outcome, SyncOutcome::Completed(_)));
        assert_eq!(report.failed(), 2);
        assert_eq!(h.store.pending_count(EntityKind::Patient).unwrap(), 2);

        h.mirror.set_unavailable(false);
        let outcome = h.orchestrator.request_sync(Trigger::Reconnect).await;
        assert_eq!(outcome.report().unwrap().synced(), 2);
        assert_eq!(h.store.pending_count(EntityKind::Patient).unwrap(), 0);
        assert_eq!(h.orchestrator.runs_completed(), 2);
        assert_eq!(
            h.orchestrator.last_report().map(|r| r.trigger),
            Some(Trigger::Reconnect)
        );
    }

    #[tokio::test]
    async fn test_repush_converges_on_one_remote_record() {
        let h = harness(true);
        let patient = add_patient(&h.store, "A100");
        h.orchestrator.request_sync(Trigger::Manual).await;
        let first = h.mirror.get(EntityKind::Patient, "A100").unwrap();

        h.store
            .update_patient(
                patient.id,
                &PatientUpdate {
                    notes: Some("follow-up in 6 months".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(h.store.get_patient(patient.id).unwrap().sync, SyncFlag::Pending);
        h.orchestrator.request_sync(Trigger::Manual).await;

        let second = h.mirror.get(EntityKind::Patient, "A100").unwrap();
        assert_eq!(first.remote_id, second.remote_id);
        assert_eq!(second.payload["notes"], "follow-up in 6 months");
        assert_eq!(h.mirror.records(EntityKind::Patient).len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_pending_makes_no_calls() {
        let h = harness(true);
        let outcome = h.orchestrator.request_sync(Trigger::Startup).await;
        assert_eq!(outcome.report().unwrap().attempted(), 0);
        assert!(h.mirror.calls().is_empty());
    }

    #[tokio::test]
    async fn test_push_now() {
        let h = harness(false);
        let patient = add_patient(&h.store, "A100");
        let record = Record::from(patient.clone());

        assert!(!h.orchestrator.push_now(&record).await.unwrap());
        assert!(h.mirror.calls().is_empty());

        h.monitor.report(true);
        assert!(h.orchestrator.push_now(&record).await.unwrap());
        assert_eq!(h.store.get_patient(patient.id).unwrap().sync, SyncFlag::Synced);

        h.mirror.reject_key("A101");
        let other = Record::from(add_patient(&h.store, "A101"));
        assert!(!h.orchestrator.push_now(&other).await.unwrap());
        assert_eq!(h.store.pending_count(EntityKind::Patient).unwrap(), 1);
    }
}
