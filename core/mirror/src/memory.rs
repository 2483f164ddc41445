//! In-memory remote mirror for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{watch, Notify};
use tracing::debug;
use uuid::Uuid;

use ocuscan_common::{EntityKind, Error, Record, Result, User};

use crate::mirror::{to_remote, RemoteIdentity, RemoteMirror, RemoteRecord};

/// A call received by the memory mirror.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorCall {
    Identity,
    EnsureAccount { email: String },
    Upsert { kind: EntityKind, natural_key: String },
}

#[derive(Default)]
struct MirrorState {
    records: HashMap<(EntityKind, String), RemoteRecord>,
    accounts: HashMap<String, RemoteIdentity>,
    session: Option<RemoteIdentity>,
    calls: Vec<MirrorCall>,
    unavailable: bool,
    require_auth: bool,
    rejected_keys: HashSet<String>,
    failing_profiles: HashSet<String>,
}

/// In-memory remote mirror.
///
/// Records every call and lets tests inject failures: the whole mirror can go
/// unavailable, single natural keys can be rejected, the profile step of a
/// user push can fail, and upserts can be held until released.
#[derive(Clone)]
pub struct MemoryMirror {
    state: Arc<Mutex<MirrorState>>,
    hold: Arc<watch::Sender<bool>>,
    activity: Arc<Notify>,
}

impl MemoryMirror {
    /// Create a new empty mirror.
    pub fn new() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(MirrorState::default())),
            hold: Arc::new(hold),
            activity: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MirrorState> {
        // Poisoning only happens if a test panicked mid-call.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_call(&self, call: MirrorCall) {
        self.lock().calls.push(call);
        self.activity.notify_waiters();
    }

    fn check_available(&self) -> Result<()> {
        if self.lock().unavailable {
            return Err(Error::RemoteUnavailable("memory mirror offline".to_string()));
        }
        Ok(())
    }

    /// Make every call fail with `RemoteUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    /// Refuse patient and scan upserts that carry no owner.
    pub fn set_require_auth(&self, require: bool) {
        self.lock().require_auth = require;
    }

    /// Reject every upsert for this natural key.
    pub fn reject_key(&self, natural_key: impl Into<String>) {
        self.lock().rejected_keys.insert(natural_key.into());
    }

    /// Stop rejecting a natural key.
    pub fn accept_key(&self, natural_key: &str) {
        self.lock().rejected_keys.remove(natural_key);
    }

    /// Let account creation succeed but fail the profile upsert for this email.
    pub fn fail_profile_for(&self, email: impl Into<String>) {
        self.lock().failing_profiles.insert(email.into());
    }

    pub fn clear_profile_failures(&self) {
        self.lock().failing_profiles.clear();
    }

    /// Block upserts until `release_upserts` is called.
    pub fn hold_upserts(&self) {
        self.hold.send_replace(true);
    }

    pub fn release_upserts(&self) {
        self.hold.send_replace(false);
    }

    /// Start a session without going through account creation.
    pub fn sign_in(&self, identity: RemoteIdentity) {
        self.lock().session = Some(identity);
    }

    pub fn sign_out(&self) {
        self.lock().session = None;
    }

    /// Every call received so far, in order.
    pub fn calls(&self) -> Vec<MirrorCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Upserts received for one kind, in order.
    pub fn upserts(&self, kind: EntityKind) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                MirrorCall::Upsert { kind: k, natural_key } if *k == kind => {
                    Some(natural_key.clone())
                }
                _ => None,
            })
            .collect()
    }

    /// Wait until at least `count` calls have been received.
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let notified = self.activity.notified();
            if self.lock().calls.len() >= count {
                return;
            }
            notified.await;
        }
    }

    pub fn get(&self, kind: EntityKind, natural_key: &str) -> Option<RemoteRecord> {
        self.lock()
            .records
            .get(&(kind, natural_key.to_string()))
            .cloned()
    }

    /// Stored records of one kind.
    pub fn records(&self, kind: EntityKind) -> Vec<RemoteRecord> {
        self.lock()
            .records
            .values()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    pub fn account(&self, email: &str) -> Option<RemoteIdentity> {
        self.lock().accounts.get(email).cloned()
    }
}

impl Default for MemoryMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteMirror for MemoryMirror {
    fn name(&self) -> &str {
        "memory"
    }

    async fn identity(&self) -> Result<Option<RemoteIdentity>> {
        self.record_call(MirrorCall::Identity);
        self.check_available()?;
        Ok(self.lock().session.clone())
    }

    async fn ensure_account(&self, user: &User) -> Result<RemoteIdentity> {
        let email = user.email.as_str().to_string();
        self.record_call(MirrorCall::EnsureAccount {
            email: email.clone(),
        });
        self.check_available()?;

        let mut state = self.lock();
        let identity = state
            .accounts
            .entry(email)
            .or_insert_with(|| RemoteIdentity {
                user_id: Uuid::new_v4().to_string(),
                email: user.email.clone(),
            })
            .clone();
        // Sign-up signs the account in.
        state.session = Some(identity.clone());
        Ok(identity)
    }

    async fn upsert(&self, record: &Record, owner: Option<&RemoteIdentity>) -> Result<RemoteRecord> {
        let kind = record.kind();
        let natural_key = record.natural_key();
        self.record_call(MirrorCall::Upsert {
            kind,
            natural_key: natural_key.clone(),
        });

        let mut held = self.hold.subscribe();
        // The sender lives as long as self, so this cannot fail.
        let _ = held.wait_for(|held| !*held).await;

        self.check_available()?;

        let mut state = self.lock();
        if state.require_auth && owner.is_none() && kind != EntityKind::User {
            return Err(Error::AuthRequired(format!("{} {} has no owner", kind, natural_key)));
        }
        if state.rejected_keys.contains(&natural_key) {
            return Err(Error::RemoteRejected(format!("{} {} refused", kind, natural_key)));
        }
        if kind == EntityKind::User && state.failing_profiles.contains(&natural_key) {
            return Err(Error::RemoteRejected(format!(
                "profile insert for {} failed",
                natural_key
            )));
        }

        let key = (kind, natural_key);
        let remote = to_remote(record, owner, state.records.get(&key));
        state.records.insert(key, remote.clone());
        debug!("Memory mirror stored {} {}", remote.kind, remote.natural_key);
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ocuscan_common::{Email, Patient, RecordId, Secret, SyncFlag};

    fn patient(record_number: &str) -> Record {
        let now = Utc::now();
        Record::Patient(Patient {
            id: RecordId::new(1),
            record_number: record_number.to_string(),
            full_name: "Jane Doe".to_string(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
            sync: SyncFlag::Pending,
        })
    }

    fn user(email: &str) -> User {
        User {
            id: RecordId::new(1),
            email: Email::parse(email).unwrap(),
            secret: Secret::new("pw"),
            full_name: "Dr. Grey".to_string(),
            organization: String::new(),
            role: "doctor".to_string(),
            created_at: Utc::now(),
            revision: 0,
            sync: SyncFlag::Pending,
        }
    }

    #[tokio::test]
    async fn test_upsert_converges_by_natural_key() {
        let mirror = MemoryMirror::new();
        let first = mirror.upsert(&patient("A100"), None).await.unwrap();
        let second = mirror.upsert(&patient("A100"), None).await.unwrap();

        assert_eq!(first.remote_id, second.remote_id);
        assert_eq!(mirror.records(EntityKind::Patient).len(), 1);
        assert_eq!(mirror.upserts(EntityKind::Patient), vec!["A100", "A100"]);
    }

    #[tokio::test]
    async fn test_ensure_account_idempotent() {
        let mirror = MemoryMirror::new();
        let a = mirror.ensure_account(&user("doc@clinic.org")).await.unwrap();
        let b = mirror.ensure_account(&user("DOC@clinic.org")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(mirror.identity().await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let mirror = MemoryMirror::new();

        mirror.set_unavailable(true);
        let err = mirror.upsert(&patient("A1"), None).await.unwrap_err();
        assert!(matches!(err, Error::RemoteUnavailable(_)));
        mirror.set_unavailable(false);

        mirror.reject_key("A2");
        let err = mirror.upsert(&patient("A2"), None).await.unwrap_err();
        assert!(matches!(err, Error::RemoteRejected(_)));

        mirror.set_require_auth(true);
        let err = mirror.upsert(&patient("A3"), None).await.unwrap_err();
        assert!(matches!(err, Error::AuthRequired(_)));

        assert!(mirror.records(EntityKind::Patient).is_empty());
    }

    #[tokio::test]
    async fn test_hold_blocks_upserts() {
        let mirror = MemoryMirror::new();
        mirror.hold_upserts();

        let task = {
            let mirror = mirror.clone();
            tokio::spawn(async move { mirror.upsert(&patient("A100"), None).await })
        };

        mirror.wait_for_calls(1).await;
        assert!(mirror.get(EntityKind::Patient, "A100").is_none());

        mirror.release_upserts();
        task.await.unwrap().unwrap();
        assert!(mirror.get(EntityKind::Patient, "A100").is_some());
    }
}
