//! Per-entity push workers.

use tracing::{debug, error, warn};

use ocuscan_common::{EntityKind, Error, Record, Result};
use ocuscan_mirror::{RemoteIdentity, RemoteMirror, RemoteRecord};
use ocuscan_store::LocalStore;

use crate::report::KindReport;

/// Pushes the pending records of one entity kind.
pub struct EntityWorker<'a> {
    kind: EntityKind,
    store: &'a LocalStore,
    mirror: &'a dyn RemoteMirror,
}

impl<'a> EntityWorker<'a> {
    pub fn new(kind: EntityKind, store: &'a LocalStore, mirror: &'a dyn RemoteMirror) -> Self {
        Self {
            kind,
            store,
            mirror,
        }
    }

    /// Push every pending record, oldest first, one at a time.
    ///
    /// A failed push is logged and the record stays pending; the pass moves on
    /// to the next record and never retries within the same pass.
    ///
    /// # Errors
    /// - Only local store failures, which end the pass
    pub async fn run(&self) -> Result<KindReport> {
        let mut report = KindReport::new(self.kind);
        let snapshot = self.store.list_pending(self.kind)?;
        if snapshot.is_empty() {
            return Ok(report);
        }

        let owner = self.resolve_owner().await;

        for record in &snapshot {
            let record = record?;
            if !record.sync().is_pending() {
                debug!("{} {} synced since snapshot, skipping", self.kind, record.id());
                continue;
            }

            report.attempted += 1;
            match push_record(self.mirror, &record, owner.as_ref()).await {
                Ok(remote) => {
                    let marked =
                        self.store
                            .mark_synced_if_current(self.kind, record.id(), record.revision())?;
                    if marked {
                        debug!(
                            "Pushed {} {} as {}",
                            self.kind,
                            record.id(),
                            remote.remote_id
                        );
                        report.synced += 1;
                    } else {
                        debug!(
                            "{} {} changed during push, leaving pending",
                            self.kind,
                            record.id()
                        );
                        report.stale += 1;
                    }
                }
                Err(Error::AuthRequired(msg)) => {
                    warn!("Skipping {} {}: {}", self.kind, record.id(), msg);
                    report.auth_skipped += 1;
                }
                Err(e) => {
                    error!("Failed to push {} {}: {}", self.kind, record.id(), e);
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Remote identity patient and scan pushes are attributed to.
    async fn resolve_owner(&self) -> Option<RemoteIdentity> {
        if self.kind == EntityKind::User {
            return None;
        }
        match self.mirror.identity().await {
            Ok(Some(identity)) => Some(identity),
            Ok(None) => {
                warn!("No remote session; pushing {} records without owner", self.kind);
                None
            }
            Err(e) => {
                warn!("Could not resolve remote identity: {}", e);
                None
            }
        }
    }
}

/// Push one record with its complete remote contract.
///
/// A user push is account registration followed by the profile upsert; it
/// only succeeds if both steps do, so a half-created user is retried whole.
pub async fn push_record(
    mirror: &dyn RemoteMirror,
    record: &Record,
    owner: Option<&RemoteIdentity>,
) -> Result<RemoteRecord> {
    match record {
        Record::User(user) => {
            let identity = mirror.ensure_account(user).await?;
            mirror.upsert(record, Some(&identity)).await
        }
        Record::Patient(_) | Record::Scan(_) => mirror.upsert(record, owner).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocuscan_common::{NewPatient, NewScan, NewUser, PatientUpdate, Secret, SyncFlag};
    use ocuscan_mirror::{MemoryMirror, MirrorCall};
    use ocuscan_store::StoreConfig;

    fn store() -> LocalStore {
        LocalStore::in_memory(StoreConfig::default()).unwrap()
    }

    fn add_patient(store: &LocalStore, record_number: &str) -> ocuscan_common::Patient {
        store
            .create_patient(&NewPatient::new(record_number, "Jane Doe", "").unwrap())
            .unwrap()
    }

    #[tokio::test]
    async fn test_failure_isolation() {
        let store = store();
        let mirror = MemoryMirror::new();
        let first = add_patient(&store, "P1");
        let second = add_patient(&store, "P2");
        let third = add_patient(&store, "P3");
        mirror.reject_key("P2");

        let report = EntityWorker::new(EntityKind::Patient, &store, &mirror)
            .run()
            .await
            .unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(store.get_patient(first.id).unwrap().sync, SyncFlag::Synced);
        assert_eq!(store.get_patient(second.id).unwrap().sync, SyncFlag::Pending);
        assert_eq!(store.get_patient(third.id).unwrap().sync, SyncFlag::Synced);
        assert_eq!(mirror.upserts(EntityKind::Patient), vec!["P1", "P2", "P3"]);
    }

    #[tokio::test]
    async fn test_unavailable_leaves_pending_for_next_pass() {
        let store = store();
        let mirror = MemoryMirror::new();
        let patient = add_patient(&store, "A100");

        mirror.set_unavailable(true);
        let report = EntityWorker::new(EntityKind::Patient, &store, &mirror)
            .run()
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(store.get_patient(patient.id).unwrap().sync, SyncFlag::Pending);

        mirror.set_unavailable(false);
        let report = EntityWorker::new(EntityKind::Patient, &store, &mirror)
            .run()
            .await
            .unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(store.get_patient(patient.id).unwrap().sync, SyncFlag::Synced);
    }

    #[tokio::test]
    async fn test_user_partial_push_stays_pending() {
        let store = store();
        let mirror = MemoryMirror::new();
        let user = store
            .create_user(
                &NewUser::new("doc@clinic.org", Secret::new("pw"), "Dr. Grey", "", "doctor")
                    .unwrap(),
            )
            .unwrap();
        mirror.fail_profile_for("doc@clinic.org");

        let report = EntityWorker::new(EntityKind::User, &store, &mirror)
            .run()
            .await
            .unwrap();
        assert_eq!(report.failed, 1);
        assert!(mirror.account("doc@clinic.org").is_some());
        assert_eq!(store.get_user(user.id).unwrap().sync, SyncFlag::Pending);

        // Next pass retries the whole unit and reuses the remote account
        let account = mirror.account("doc@clinic.org").unwrap();
        mirror.clear_profile_failures();
        let report = EntityWorker::new(EntityKind::User, &store, &mirror)
            .run()
            .await
            .unwrap();
        assert_eq!(report.synced, 1);
        assert_eq!(mirror.account("doc@clinic.org"), Some(account.clone()));
        let profile = mirror.get(EntityKind::User, "doc@clinic.org").unwrap();
        assert_eq!(profile.owner, Some(account.user_id));
        assert_eq!(store.get_user(user.id).unwrap().sync, SyncFlag::Synced);
    }

    #[tokio::test]
    async fn test_auth_required_skips_record() {
        let store = store();
        let mirror = MemoryMirror::new();
        let patient = add_patient(&store, "A100");
        let scan = store
            .create_scan(&NewScan::new(patient.id, "file:///a.jpg", None, None).unwrap())
            .unwrap();
        mirror.set_require_auth(true);

        let report = EntityWorker::new(EntityKind::Scan, &store, &mirror)
            .run()
            .await
            .unwrap();
        assert_eq!(report.auth_skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(store.get_scan(scan.id).unwrap().sync, SyncFlag::Pending);
    }

    #[tokio::test]
    async fn test_owner_attached_from_session() {
        let store = store();
        let mirror = MemoryMirror::new();
        let identity = RemoteIdentity {
            user_id: "remote-7".to_string(),
            email: ocuscan_common::Email::parse("doc@clinic.org").unwrap(),
        };
        mirror.sign_in(identity);
        add_patient(&store, "A100");
        add_patient(&store, "A101");

        EntityWorker::new(EntityKind::Patient, &store, &mirror)
            .run()
            .await
            .unwrap();

        let remote = mirror.get(EntityKind::Patient, "A101").unwrap();
        assert_eq!(remote.owner.as_deref(), Some("remote-7"));
        // Identity is resolved once per pass
        let identity_calls = mirror
            .calls()
            .iter()
            .filter(|c| **c == MirrorCall::Identity)
            .count();
        assert_eq!(identity_calls, 1);
    }

    #[tokio::test]
    async fn test_edit_during_push_stays_pending() {
        let store = store();
        let mirror = MemoryMirror::new();
        let patient = add_patient(&store, "A100");
        mirror.hold_upserts();

        let pass = {
            let store = store.clone();
            let mirror = mirror.clone();
            tokio::spawn(async move {
                EntityWorker::new(EntityKind::Patient, &store, &mirror)
                    .run()
                    .await
            })
        };

        // Identity lookup, then the held upsert
        mirror.wait_for_calls(2).await;
        store
            .update_patient(
                patient.id,
                &PatientUpdate {
                    notes: Some("edited mid-push".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        mirror.release_upserts();

        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.stale, 1);
        assert_eq!(report.synced, 0);
        assert_eq!(store.get_patient(patient.id).unwrap().sync, SyncFlag::Pending);
    }

    #[tokio::test]
    async fn test_store_failure_is_fatal() {
        let store = store();
        let mirror = MemoryMirror::new();
        store.close();

        let err = EntityWorker::new(EntityKind::User, &store, &mirror)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(mirror.calls().is_empty());
    }
}
