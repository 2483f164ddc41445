//! Common utilities and types shared across the OcuScan sync engine.
//!
//! This module provides the error taxonomy, identifiers and domain records
//! used by the local store, the remote mirror boundary and the sync workers.

pub mod error;
pub mod model;
pub mod types;

pub use error::{Error, Result};
pub use model::{
    validate_confidence, NewPatient, NewScan, NewUser, Patient, PatientUpdate, Record, Scan,
    ScanUpdate, User, UserUpdate,
};
pub use types::{Email, EntityKind, RecordId, Secret, SyncFlag};
