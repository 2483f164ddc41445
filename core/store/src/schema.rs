//! Table definitions for the local store.

/// Schema applied on every open. Tables are created if missing; there are no migrations.
pub const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    email TEXT UNIQUE NOT NULL,
    secret TEXT NOT NULL,
    full_name TEXT NOT NULL,
    organization TEXT NOT NULL,
    role TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS patients (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_number TEXT UNIQUE NOT NULL,
    full_name TEXT NOT NULL,
    notes TEXT NOT NULL DEFAULT '',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS scans (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    patient_id INTEGER NOT NULL REFERENCES patients (id),
    sync_key TEXT UNIQUE NOT NULL,
    image_ref TEXT NOT NULL,
    diagnosis TEXT,
    confidence REAL,
    created_at INTEGER NOT NULL,
    revision INTEGER NOT NULL DEFAULT 0,
    synced INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_users_pending ON users (synced, created_at);
CREATE INDEX IF NOT EXISTS idx_patients_pending ON patients (synced, created_at);
CREATE INDEX IF NOT EXISTS idx_scans_pending ON scans (synced, created_at);
CREATE INDEX IF NOT EXISTS idx_scans_patient ON scans (patient_id);
"#;

pub(crate) const USER_COLUMNS: &str =
    "id, email, secret, full_name, organization, role, created_at, revision, synced";

pub(crate) const PATIENT_COLUMNS: &str =
    "id, record_number, full_name, notes, created_at, updated_at, revision, synced";

pub(crate) const SCAN_SELECT: &str = r#"
    SELECT s.id, s.patient_id, p.record_number, s.sync_key, s.image_ref,
           s.diagnosis, s.confidence, s.created_at, s.revision, s.synced
    FROM scans s JOIN patients p ON p.id = s.patient_id
"#;
