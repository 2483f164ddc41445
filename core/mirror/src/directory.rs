//! Local filesystem remote mirror.

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

use ocuscan_common::{EntityKind, Error, Record, Result, User};

use crate::mirror::{to_remote, RemoteIdentity, RemoteMirror, RemoteRecord};

/// Remote mirror backed by a directory of JSON documents.
///
/// Layout:
/// - `<root>/<table>/<natural key>.json` for records
/// - `<root>/accounts/<email>.json` for accounts
/// - `<root>/session.json` for the signed-in identity
///
/// Useful for development and for inspecting what a sync run would push.
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    /// Create a mirror rooted at the given directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        // Create root if it doesn't exist (sync for constructor)
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn file_name(key: &str) -> String {
        format!("{}.json", utf8_percent_encode(key, NON_ALPHANUMERIC))
    }

    fn record_path(&self, kind: EntityKind, natural_key: &str) -> PathBuf {
        self.root.join(kind.table()).join(Self::file_name(natural_key))
    }

    fn account_path(&self, email: &str) -> PathBuf {
        self.root.join("accounts").join(Self::file_name(email))
    }

    fn session_path(&self) -> PathBuf {
        self.root.join("session.json")
    }

    async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(unavailable(path, e)),
        }
    }

    /// Write through a temp file and rename so readers never see a partial document.
    async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| unavailable(parent, e))?;
        }
        let data = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4()));
        fs::write(&tmp, &data).await.map_err(|e| unavailable(&tmp, e))?;
        fs::rename(&tmp, path).await.map_err(|e| unavailable(path, e))?;
        Ok(())
    }

    /// Read a stored record back.
    pub async fn get(&self, kind: EntityKind, natural_key: &str) -> Result<Option<RemoteRecord>> {
        Self::read_json(&self.record_path(kind, natural_key)).await
    }

    /// All stored records of one kind.
    pub async fn records(&self, kind: EntityKind) -> Result<Vec<RemoteRecord>> {
        let dir = self.root.join(kind.table());
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(unavailable(&dir, e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| unavailable(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_json::<RemoteRecord>(&path).await? {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.natural_key.cmp(&b.natural_key));
        Ok(records)
    }
}

fn unavailable(path: &Path, e: std::io::Error) -> Error {
    Error::RemoteUnavailable(format!("{}: {}", path.display(), e))
}

#[async_trait]
impl RemoteMirror for DirectoryMirror {
    fn name(&self) -> &str {
        "directory"
    }

    async fn identity(&self) -> Result<Option<RemoteIdentity>> {
        Self::read_json(&self.session_path()).await
    }

    async fn ensure_account(&self, user: &User) -> Result<RemoteIdentity> {
        let path = self.account_path(user.email.as_str());
        let identity = match Self::read_json::<RemoteIdentity>(&path).await? {
            Some(existing) => existing,
            None => {
                let created = RemoteIdentity {
                    user_id: Uuid::new_v4().to_string(),
                    email: user.email.clone(),
                };
                Self::write_json(&path, &created).await?;
                debug!("Directory mirror created account {}", user.email);
                created
            }
        };
        Self::write_json(&self.session_path(), &identity).await?;
        Ok(identity)
    }

    async fn upsert(&self, record: &Record, owner: Option<&RemoteIdentity>) -> Result<RemoteRecord> {
        let path = self.record_path(record.kind(), &record.natural_key());
        let existing = Self::read_json::<RemoteRecord>(&path).await?;
        let remote = to_remote(record, owner, existing.as_ref());
        Self::write_json(&path, &remote).await?;
        debug!("Directory mirror stored {} {}", remote.kind, remote.natural_key);
        Ok(remote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use ocuscan_common::{Email, Patient, RecordId, Secret, SyncFlag};

    fn patient(record_number: &str, name: &str) -> Record {
        let now = Utc::now();
        Record::Patient(Patient {
            id: RecordId::new(3),
            record_number: record_number.to_string(),
            full_name: name.to_string(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
            sync: SyncFlag::Pending,
        })
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = DirectoryMirror::new(dir.path()).unwrap();

        let first = mirror.upsert(&patient("A/100", "Jane Doe"), None).await.unwrap();
        let second = mirror.upsert(&patient("A/100", "Jane Roe"), None).await.unwrap();
        assert_eq!(first.remote_id, second.remote_id);

        let records = mirror.records(EntityKind::Patient).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].payload["full_name"], "Jane Roe");
        assert!(mirror.get(EntityKind::Patient, "A/100").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_account_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = DirectoryMirror::new(dir.path()).unwrap();
        assert!(mirror.identity().await.unwrap().is_none());

        let user = User {
            id: RecordId::new(1),
            email: Email::parse("doc@clinic.org").unwrap(),
            secret: Secret::new("pw"),
            full_name: "Dr. Grey".to_string(),
            organization: String::new(),
            role: "doctor".to_string(),
            created_at: Utc::now(),
            revision: 0,
            sync: SyncFlag::Pending,
        };
        let a = mirror.ensure_account(&user).await.unwrap();
        let b = mirror.ensure_account(&user).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(mirror.identity().await.unwrap(), Some(a));
    }
}
