//! Application-facing sync service.
//!
//! Built once at startup. Wires the connectivity monitor to the orchestrator,
//! kicks off the startup run and fronts the local store's write API.

use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use ocuscan_common::{
    Error, NewPatient, NewScan, NewUser, Patient, PatientUpdate, Record, RecordId, Result, Scan,
    ScanUpdate, User, UserUpdate,
};
use ocuscan_mirror::RemoteMirror;
use ocuscan_store::{KindStatus, LocalStore};

use crate::config::SyncConfig;
use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::orchestrator::SyncOrchestrator;
use crate::report::{SyncOutcome, Trigger};

/// Running sync service.
///
/// Dropping the service deregisters its connectivity listener; runs already
/// spawned finish on their own.
pub struct SyncService {
    store: LocalStore,
    orchestrator: Arc<SyncOrchestrator>,
    config: SyncConfig,
    runtime: Handle,
    startup: Mutex<Option<JoinHandle<SyncOutcome>>>,
    _reconnect: Subscription,
}

impl SyncService {
    /// Start the service on the current tokio runtime.
    ///
    /// Requests a `Startup` run and a `Reconnect` run on every offline to
    /// online transition the monitor reports.
    ///
    /// # Errors
    /// - Called outside a tokio runtime
    pub fn start(
        store: LocalStore,
        mirror: Arc<dyn RemoteMirror>,
        monitor: ConnectivityMonitor,
        config: SyncConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| {
            Error::InvalidInput(format!("Sync service needs a tokio runtime: {}", e))
        })?;

        let orchestrator = Arc::new(SyncOrchestrator::new(
            store.clone(),
            mirror,
            monitor.clone(),
            &config,
        ));

        // The listener lives inside the monitor; a strong reference here
        // would keep the orchestrator alive after the service is gone.
        let weak = Arc::downgrade(&orchestrator);
        let listener_runtime = runtime.clone();
        let reconnect = monitor.on_transition(move |online| {
            if !online {
                return;
            }
            if let Some(orchestrator) = weak.upgrade() {
                orchestrator.spawn_request(&listener_runtime, Trigger::Reconnect);
            }
        });

        let startup = orchestrator.spawn_request(&runtime, Trigger::Startup);
        info!(
            "Sync service started (mirror: {}, online: {})",
            orchestrator.mirror().name(),
            monitor.currently_online()
        );

        Ok(Self {
            store,
            orchestrator,
            config,
            runtime,
            startup: Mutex::new(Some(startup)),
            _reconnect: reconnect,
        })
    }

    /// Wait for the startup run. Returns `None` once it has been collected.
    pub async fn startup_outcome(&self) -> Option<SyncOutcome> {
        let startup = self
            .startup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        match startup.await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!("Startup sync task failed: {}", e);
                None
            }
        }
    }

    /// Request a run now.
    pub async fn request_sync(&self, trigger: Trigger) -> SyncOutcome {
        self.orchestrator.request_sync(trigger).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncOutcome> {
        self.orchestrator.subscribe()
    }

    pub fn status(&self) -> Result<Vec<KindStatus>> {
        self.store.status()
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn monitor(&self) -> &ConnectivityMonitor {
        self.orchestrator.monitor()
    }

    // ---------------------------------------------------------------------
    // Write API
    // ---------------------------------------------------------------------

    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let user = self.store.create_user(new)?;
        self.push_in_background(Record::User(user.clone()));
        Ok(user)
    }

    pub fn update_user(&self, id: RecordId, update: &UserUpdate) -> Result<User> {
        let user = self.store.update_user(id, update)?;
        self.push_in_background(Record::User(user.clone()));
        Ok(user)
    }

    pub fn create_patient(&self, new: &NewPatient) -> Result<Patient> {
        let patient = self.store.create_patient(new)?;
        self.push_in_background(Record::Patient(patient.clone()));
        Ok(patient)
    }

    pub fn update_patient(&self, id: RecordId, update: &PatientUpdate) -> Result<Patient> {
        let patient = self.store.update_patient(id, update)?;
        self.push_in_background(Record::Patient(patient.clone()));
        Ok(patient)
    }

    pub fn create_scan(&self, new: &NewScan) -> Result<Scan> {
        let scan = self.store.create_scan(new)?;
        self.push_in_background(Record::Scan(scan.clone()));
        Ok(scan)
    }

    pub fn update_scan(&self, id: RecordId, update: &ScanUpdate) -> Result<Scan> {
        let scan = self.store.update_scan(id, update)?;
        self.push_in_background(Record::Scan(scan.clone()));
        Ok(scan)
    }

    /// Best-effort push of a freshly written record.
    fn push_in_background(&self, record: Record) {
        if !self.config.immediate_push
            || !record.sync().is_pending()
            || !self.monitor().currently_online()
        {
            return;
        }
        debug!("Immediate push of {} {}", record.kind(), record.id());
        let orchestrator = Arc::clone(&self.orchestrator);
        self.runtime.spawn(async move {
            if let Err(e) = orchestrator.push_now(&record).await {
                warn!(
                    "Immediate push of {} {} hit a local store error: {}",
                    record.kind(),
                    record.id(),
                    e
                );
            }
        });
    }
}
