//! SQLite-backed local store.
//!
//! Every application write lands here first. Records carry a sync flag that
//! stays `Pending` until the sync workers confirm a push to the remote mirror.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use ocuscan_common::{
    Email, EntityKind, Error, NewPatient, NewScan, NewUser, Patient, PatientUpdate, Record,
    RecordId, Result, Scan, ScanUpdate, Secret, SyncFlag, User, UserUpdate,
};

use crate::config::{StoreConfig, UpdatePolicy};
use crate::pending::PendingSnapshot;
use crate::schema::{PATIENT_COLUMNS, SCAN_SELECT, SCHEMA, USER_COLUMNS};

/// Pending and synced counts for one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindStatus {
    pub kind: EntityKind,
    pub pending: u64,
    pub synced: u64,
}

/// Local store handle.
///
/// Cheap to clone; all clones share one connection. Each operation runs under
/// the connection lock, so no caller observes a half-applied write.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Option<Connection>>>,
    config: StoreConfig,
}

impl LocalStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Parent directory cannot be created
    /// - Database open or schema creation failure
    pub fn open(db_path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path).map_err(sql_err)?;
        let store = Self::init(conn, config)?;
        info!("Local store opened at {}", db_path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory(config: StoreConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn, config)
    }

    fn init(conn: Connection, config: StoreConfig) -> Result<Self> {
        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .map_err(sql_err)?;
        conn.execute_batch(SCHEMA).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(Some(conn))),
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Release the connection. Every later operation fails with `Storage`.
    pub fn close(&self) {
        if let Ok(mut guard) = self.conn.lock() {
            if guard.take().is_some() {
                info!("Local store closed");
            }
        }
    }

    fn with_conn<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| Error::Storage("local store lock poisoned".to_string()))?;
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::Storage("local store is closed".to_string()))?;
        op(conn)
    }

    fn resets_flag(&self) -> bool {
        self.config.update_policy == UpdatePolicy::MarkPending
    }

    // ---------------------------------------------------------------------
    // Users
    // ---------------------------------------------------------------------

    /// Persist a new user with flag `Pending`.
    ///
    /// # Errors
    /// - `ConstraintViolation` if the email is already registered
    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let user = self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO users (email, secret, full_name, organization, role, created_at, synced)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    new.email.as_str(),
                    new.secret.expose(),
                    new.full_name,
                    new.organization,
                    new.role,
                    Utc::now().timestamp_millis(),
                    SyncFlag::Pending.to_db(),
                ],
            )
            .map_err(sql_err)?;
            query_user(conn, RecordId::new(conn.last_insert_rowid()))
        })?;
        debug!("Created user {} ({})", user.id, user.email);
        Ok(user)
    }

    /// Apply a profile edit.
    ///
    /// # Errors
    /// - `NotFound` if no user has this id
    pub fn update_user(&self, id: RecordId, update: &UserUpdate) -> Result<User> {
        update.validate()?;
        let reset = self.resets_flag();
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    r#"
                    UPDATE users SET
                        full_name = COALESCE(?1, full_name),
                        organization = COALESCE(?2, organization),
                        role = COALESCE(?3, role),
                        revision = revision + 1,
                        synced = CASE WHEN ?4 THEN 0 ELSE synced END
                    WHERE id = ?5
                    "#,
                    params![
                        update.full_name,
                        update.organization,
                        update.role,
                        reset,
                        id.get()
                    ],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(not_found(EntityKind::User, id));
            }
            query_user(conn, id)
        })
    }

    pub fn get_user(&self, id: RecordId) -> Result<User> {
        self.with_conn(|conn| query_user(conn, id))
    }

    pub fn find_user_by_email(&self, email: &Email) -> Result<Option<User>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM users WHERE email = ?1", USER_COLUMNS),
                [email.as_str()],
                user_from_row,
            )
            .optional()
            .map_err(sql_err)
        })
    }

    pub fn email_exists(&self, email: &Email) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM users WHERE email = ?1",
                    [email.as_str()],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            Ok(count > 0)
        })
    }

    /// Check credentials against the locally stored account.
    ///
    /// Returns `None` for an unknown email or a wrong secret.
    pub fn authenticate_user(&self, email: &str, secret: &Secret) -> Result<Option<User>> {
        let Ok(email) = Email::parse(email) else {
            return Ok(None);
        };
        let user = self.find_user_by_email(&email)?;
        Ok(user.filter(|u| u.secret.matches(secret)))
    }

    // ---------------------------------------------------------------------
    // Patients
    // ---------------------------------------------------------------------

    /// Persist a new patient with flag `Pending`.
    ///
    /// # Errors
    /// - `ConstraintViolation` if the record number is taken
    pub fn create_patient(&self, new: &NewPatient) -> Result<Patient> {
        let patient = self.with_conn(|conn| {
            let now = Utc::now().timestamp_millis();
            conn.execute(
                r#"
                INSERT INTO patients (record_number, full_name, notes, created_at, updated_at, synced)
                VALUES (?1, ?2, ?3, ?4, ?4, ?5)
                "#,
                params![
                    new.record_number,
                    new.full_name,
                    new.notes,
                    now,
                    SyncFlag::Pending.to_db(),
                ],
            )
            .map_err(sql_err)?;
            query_patient(conn, RecordId::new(conn.last_insert_rowid()))
        })?;
        debug!("Created patient {} ({})", patient.id, patient.record_number);
        Ok(patient)
    }

    /// Apply a detail edit.
    ///
    /// # Errors
    /// - `NotFound` if no patient has this id
    pub fn update_patient(&self, id: RecordId, update: &PatientUpdate) -> Result<Patient> {
        update.validate()?;
        let reset = self.resets_flag();
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    r#"
                    UPDATE patients SET
                        full_name = COALESCE(?1, full_name),
                        notes = COALESCE(?2, notes),
                        updated_at = ?3,
                        revision = revision + 1,
                        synced = CASE WHEN ?4 THEN 0 ELSE synced END
                    WHERE id = ?5
                    "#,
                    params![
                        update.full_name,
                        update.notes,
                        Utc::now().timestamp_millis(),
                        reset,
                        id.get()
                    ],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(not_found(EntityKind::Patient, id));
            }
            query_patient(conn, id)
        })
    }

    pub fn get_patient(&self, id: RecordId) -> Result<Patient> {
        self.with_conn(|conn| query_patient(conn, id))
    }

    /// All patients, newest first.
    pub fn list_patients(&self) -> Result<Vec<Patient>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM patients ORDER BY created_at DESC, id DESC",
                    PATIENT_COLUMNS
                ))
                .map_err(sql_err)?;
            let rows = stmt.query_map([], patient_from_row).map_err(sql_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
        })
    }

    // ---------------------------------------------------------------------
    // Scans
    // ---------------------------------------------------------------------

    /// Persist a new scan with flag `Pending` and a fresh sync key.
    ///
    /// # Errors
    /// - `ConstraintViolation` if the patient does not exist
    pub fn create_scan(&self, new: &NewScan) -> Result<Scan> {
        let scan = self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO scans (patient_id, sync_key, image_ref, diagnosis, confidence, created_at, synced)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                "#,
                params![
                    new.patient_id.get(),
                    Uuid::new_v4().to_string(),
                    new.image_ref,
                    new.diagnosis,
                    new.confidence,
                    Utc::now().timestamp_millis(),
                    SyncFlag::Pending.to_db(),
                ],
            )
            .map_err(sql_err)?;
            query_scan(conn, RecordId::new(conn.last_insert_rowid()))
        })?;
        debug!("Created scan {} for patient {}", scan.id, scan.patient_id);
        Ok(scan)
    }

    /// Attach diagnosis results to a scan.
    ///
    /// # Errors
    /// - `NotFound` if no scan has this id
    pub fn update_scan(&self, id: RecordId, update: &ScanUpdate) -> Result<Scan> {
        update.validate()?;
        let reset = self.resets_flag();
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    r#"
                    UPDATE scans SET
                        diagnosis = COALESCE(?1, diagnosis),
                        confidence = COALESCE(?2, confidence),
                        revision = revision + 1,
                        synced = CASE WHEN ?3 THEN 0 ELSE synced END
                    WHERE id = ?4
                    "#,
                    params![update.diagnosis, update.confidence, reset, id.get()],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(not_found(EntityKind::Scan, id));
            }
            query_scan(conn, id)
        })
    }

    pub fn get_scan(&self, id: RecordId) -> Result<Scan> {
        self.with_conn(|conn| query_scan(conn, id))
    }

    /// Scans taken for a patient, newest first.
    pub fn scans_for_patient(&self, patient_id: RecordId) -> Result<Vec<Scan>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "{} WHERE s.patient_id = ?1 ORDER BY s.created_at DESC, s.id DESC",
                    SCAN_SELECT
                ))
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([patient_id.get()], scan_from_row)
                .map_err(sql_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
        })
    }

    // ---------------------------------------------------------------------
    // Sync bookkeeping
    // ---------------------------------------------------------------------

    /// Load any record by kind and local id.
    pub fn get_record(&self, kind: EntityKind, id: RecordId) -> Result<Record> {
        self.with_conn(|conn| match kind {
            EntityKind::User => query_user(conn, id).map(Record::User),
            EntityKind::Patient => query_patient(conn, id).map(Record::Patient),
            EntityKind::Scan => query_scan(conn, id).map(Record::Scan),
        })
    }

    /// Snapshot of pending records of one kind, oldest first.
    ///
    /// The id list is fixed at call time; records are loaded as the snapshot
    /// is iterated, so iteration reflects their state at that moment.
    pub fn list_pending(&self, kind: EntityKind) -> Result<PendingSnapshot> {
        let ids = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT id FROM {} WHERE synced = 0 ORDER BY created_at ASC, id ASC",
                    kind.table()
                ))
                .map_err(sql_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, i64>(0).map(RecordId::new))
                .map_err(sql_err)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(sql_err)
        })?;
        debug!("{} pending {} record(s)", ids.len(), kind);
        Ok(PendingSnapshot::new(kind, ids, self.clone()))
    }

    pub fn pending_count(&self, kind: EntityKind) -> Result<u64> {
        self.count_where(kind, 0)
    }

    /// Pending and synced counts for every kind, in sync order.
    pub fn status(&self) -> Result<Vec<KindStatus>> {
        EntityKind::SYNC_ORDER
            .iter()
            .map(|&kind| {
                Ok(KindStatus {
                    kind,
                    pending: self.count_where(kind, 0)?,
                    synced: self.count_where(kind, 1)?,
                })
            })
            .collect()
    }

    fn count_where(&self, kind: EntityKind, synced: i64) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM {} WHERE synced = ?1", kind.table()),
                    [synced],
                    |row| row.get(0),
                )
                .map_err(sql_err)?;
            Ok(count as u64)
        })
    }

    /// Flag a record as synced. Re-marking a synced record is a no-op.
    ///
    /// # Errors
    /// - `NotFound` if the record does not exist
    pub fn mark_synced(&self, kind: EntityKind, id: RecordId) -> Result<()> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!("UPDATE {} SET synced = ?1 WHERE id = ?2", kind.table()),
                    params![SyncFlag::Synced.to_db(), id.get()],
                )
                .map_err(sql_err)?;
            if changed == 0 {
                return Err(not_found(kind, id));
            }
            Ok(())
        })
    }

    /// Flag a record as synced only if it still carries `revision`.
    ///
    /// Returns `false` when the record was edited after it was read for the
    /// push; it then stays pending and the newer state goes out next run.
    pub fn mark_synced_if_current(
        &self,
        kind: EntityKind,
        id: RecordId,
        revision: i64,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!(
                        "UPDATE {} SET synced = ?1 WHERE id = ?2 AND revision = ?3",
                        kind.table()
                    ),
                    params![SyncFlag::Synced.to_db(), id.get(), revision],
                )
                .map_err(sql_err)?;
            if changed > 0 {
                return Ok(true);
            }
            let exists: Option<i64> = conn
                .query_row(
                    &format!("SELECT id FROM {} WHERE id = ?1", kind.table()),
                    [id.get()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sql_err)?;
            match exists {
                Some(_) => Ok(false),
                None => Err(not_found(kind, id)),
            }
        })
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn query_user(conn: &Connection, id: RecordId) -> Result<User> {
    conn.query_row(
        &format!("SELECT {} FROM users WHERE id = ?1", USER_COLUMNS),
        [id.get()],
        user_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or_else(|| not_found(EntityKind::User, id))
}

fn query_patient(conn: &Connection, id: RecordId) -> Result<Patient> {
    conn.query_row(
        &format!("SELECT {} FROM patients WHERE id = ?1", PATIENT_COLUMNS),
        [id.get()],
        patient_from_row,
    )
    .optional()
    .map_err(sql_err)?
    .ok_or_else(|| not_found(EntityKind::Patient, id))
}

fn query_scan(conn: &Connection, id: RecordId) -> Result<Scan> {
    conn.query_row(&format!("{} WHERE s.id = ?1", SCAN_SELECT), [id.get()], scan_from_row)
        .optional()
        .map_err(sql_err)?
        .ok_or_else(|| not_found(EntityKind::Scan, id))
}

fn user_from_row(row: &Row<'_>) -> rusqlite::Result<User> {
    let email: String = row.get(1)?;
    Ok(User {
        id: RecordId::new(row.get(0)?),
        email: Email::parse(&email).map_err(|e| conversion_err(1, e))?,
        secret: Secret::new(row.get::<_, String>(2)?),
        full_name: row.get(3)?,
        organization: row.get(4)?,
        role: row.get(5)?,
        created_at: from_millis(row.get(6)?),
        revision: row.get(7)?,
        sync: SyncFlag::from_db(row.get(8)?),
    })
}

fn patient_from_row(row: &Row<'_>) -> rusqlite::Result<Patient> {
    Ok(Patient {
        id: RecordId::new(row.get(0)?),
        record_number: row.get(1)?,
        full_name: row.get(2)?,
        notes: row.get(3)?,
        created_at: from_millis(row.get(4)?),
        updated_at: from_millis(row.get(5)?),
        revision: row.get(6)?,
        sync: SyncFlag::from_db(row.get(7)?),
    })
}

fn scan_from_row(row: &Row<'_>) -> rusqlite::Result<Scan> {
    let sync_key: String = row.get(3)?;
    Ok(Scan {
        id: RecordId::new(row.get(0)?),
        patient_id: RecordId::new(row.get(1)?),
        patient_record_number: row.get(2)?,
        sync_key: Uuid::parse_str(&sync_key).map_err(|e| conversion_err(3, e))?,
        image_ref: row.get(4)?,
        diagnosis: row.get(5)?,
        confidence: row.get(6)?,
        created_at: from_millis(row.get(7)?),
        revision: row.get(8)?,
        sync: SyncFlag::from_db(row.get(9)?),
    })
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

fn conversion_err<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e))
}

fn not_found(kind: EntityKind, id: RecordId) -> Error {
    Error::NotFound(format!("{} {}", kind, id))
}

/// Map SQLite failures onto the common taxonomy.
fn sql_err(e: rusqlite::Error) -> Error {
    match e {
        rusqlite::Error::SqliteFailure(ref failure, ref message)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            Error::ConstraintViolation(message.clone().unwrap_or_else(|| e.to_string()))
        }
        other => Error::Storage(other.to_string()),
    }
}
