//! Remote mirror trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use ocuscan_common::{Email, EntityKind, Record, Result, User};

/// Identity the remote backend assigned to an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteIdentity {
    /// Remote user id, opaque to the engine.
    pub user_id: String,
    pub email: Email,
}

/// A record as held by the remote mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub kind: EntityKind,
    /// Key the mirror deduplicates by.
    pub natural_key: String,
    /// Id assigned by the mirror on first insert; stable across upserts.
    pub remote_id: String,
    /// Remote user id the record is attributed to.
    pub owner: Option<String>,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

/// Authenticated client to the remote backend.
///
/// Every write is idempotent by natural key: pushing the same record twice
/// converges on one remote entry. Implementations report failures as
/// `RemoteUnavailable`, `RemoteRejected` or `AuthRequired`.
#[async_trait]
pub trait RemoteMirror: Send + Sync {
    /// Get the mirror name (e.g., "memory", "directory").
    fn name(&self) -> &str;

    /// Identity of the current session, if signed in.
    async fn identity(&self) -> Result<Option<RemoteIdentity>>;

    /// Register the user's account, or return the existing one for this email.
    ///
    /// This is the first step of a user push; the profile follows via `upsert`.
    async fn ensure_account(&self, user: &User) -> Result<RemoteIdentity>;

    /// Insert or replace the record stored under its natural key.
    ///
    /// # Postconditions
    /// - Exactly one remote entry exists for `(record.kind(), record.natural_key())`
    async fn upsert(&self, record: &Record, owner: Option<&RemoteIdentity>) -> Result<RemoteRecord>;
}

/// Build the stored form of a record, keeping an existing remote id.
pub(crate) fn to_remote(
    record: &Record,
    owner: Option<&RemoteIdentity>,
    existing: Option<&RemoteRecord>,
) -> RemoteRecord {
    RemoteRecord {
        kind: record.kind(),
        natural_key: record.natural_key(),
        remote_id: existing
            .map(|r| r.remote_id.clone())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        owner: owner.map(|o| o.user_id.clone()),
        payload: record.remote_payload(),
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocuscan_common::{Patient, RecordId, SyncFlag};

    #[test]
    fn test_remote_record_keeps_remote_id() {
        let now = Utc::now();
        let record = Record::Patient(Patient {
            id: RecordId::new(1),
            record_number: "A100".to_string(),
            full_name: "Jane Doe".to_string(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
            sync: SyncFlag::Pending,
        });

        let first = to_remote(&record, None, None);
        let second = to_remote(&record, None, Some(&first));
        assert_eq!(first.remote_id, second.remote_id);
        assert_eq!(second.natural_key, "A100");

        let json = serde_json::to_string(&second).unwrap();
        let restored: RemoteRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.kind, EntityKind::Patient);
    }
}
