//! Domain records held by the local store and mirrored remotely.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::types::{Email, EntityKind, RecordId, Secret, SyncFlag};
use crate::{Error, Result};

/// A clinician account.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: RecordId,
    pub email: Email,
    pub secret: Secret,
    pub full_name: String,
    pub organization: String,
    pub role: String,
    pub created_at: DateTime<Utc>,
    /// Bumped on every local update.
    pub revision: i64,
    pub sync: SyncFlag,
}

/// A registered patient.
#[derive(Debug, Clone, PartialEq)]
pub struct Patient {
    pub id: RecordId,
    /// Externally visible record number, unique per installation.
    pub record_number: String,
    pub full_name: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: i64,
    pub sync: SyncFlag,
}

/// A retina scan taken for a patient.
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub id: RecordId,
    pub patient_id: RecordId,
    /// Record number of the owning patient, resolved when the scan is read.
    pub patient_record_number: String,
    /// Client-generated key identifying this scan on the remote side.
    pub sync_key: Uuid,
    /// Opaque path or URI of the captured image.
    pub image_ref: String,
    pub diagnosis: Option<String>,
    /// Model confidence in `0.0..=1.0`.
    pub confidence: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub revision: i64,
    pub sync: SyncFlag,
}

/// Fields for a new user account.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: Email,
    pub secret: Secret,
    pub full_name: String,
    pub organization: String,
    pub role: String,
}

impl NewUser {
    /// Validate and build a new user.
    ///
    /// # Errors
    /// - Malformed email
    /// - Empty secret or name
    pub fn new(
        email: &str,
        secret: Secret,
        full_name: impl Into<String>,
        organization: impl Into<String>,
        role: impl Into<String>,
    ) -> Result<Self> {
        let email = Email::parse(email)?;
        if secret.is_empty() {
            return Err(Error::InvalidInput("Credential secret cannot be empty".to_string()));
        }
        let full_name = non_empty("full name", full_name.into())?;
        Ok(Self {
            email,
            secret,
            full_name,
            organization: organization.into(),
            role: role.into(),
        })
    }
}

/// Fields for a new patient.
#[derive(Debug, Clone)]
pub struct NewPatient {
    pub record_number: String,
    pub full_name: String,
    pub notes: String,
}

impl NewPatient {
    pub fn new(
        record_number: impl Into<String>,
        full_name: impl Into<String>,
        notes: impl Into<String>,
    ) -> Result<Self> {
        Ok(Self {
            record_number: non_empty("record number", record_number.into())?,
            full_name: non_empty("full name", full_name.into())?,
            notes: notes.into(),
        })
    }
}

/// Fields for a new scan.
#[derive(Debug, Clone)]
pub struct NewScan {
    pub patient_id: RecordId,
    pub image_ref: String,
    pub diagnosis: Option<String>,
    pub confidence: Option<f64>,
}

impl NewScan {
    pub fn new(
        patient_id: RecordId,
        image_ref: impl Into<String>,
        diagnosis: Option<String>,
        confidence: Option<f64>,
    ) -> Result<Self> {
        if let Some(score) = confidence {
            validate_confidence(score)?;
        }
        Ok(Self {
            patient_id,
            image_ref: non_empty("image reference", image_ref.into())?,
            diagnosis,
            confidence,
        })
    }
}

/// Profile edit for a user. Email is the natural key and cannot change.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub full_name: Option<String>,
    pub organization: Option<String>,
    pub role: Option<String>,
}

impl UserUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.full_name {
            non_empty("full name", name.clone())?;
        }
        Ok(())
    }
}

/// Detail edit for a patient. The record number is the natural key and cannot change.
#[derive(Debug, Clone, Default)]
pub struct PatientUpdate {
    pub full_name: Option<String>,
    pub notes: Option<String>,
}

impl PatientUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.full_name {
            non_empty("full name", name.clone())?;
        }
        Ok(())
    }
}

/// Diagnosis results attached to a scan after inference.
#[derive(Debug, Clone, Default)]
pub struct ScanUpdate {
    pub diagnosis: Option<String>,
    pub confidence: Option<f64>,
}

impl ScanUpdate {
    pub fn validate(&self) -> Result<()> {
        if let Some(score) = self.confidence {
            validate_confidence(score)?;
        }
        Ok(())
    }
}

/// Reject confidence scores outside `0.0..=1.0` (NaN included).
pub fn validate_confidence(score: f64) -> Result<()> {
    if (0.0..=1.0).contains(&score) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!(
            "Confidence score {} is outside 0..1",
            score
        )))
    }
}

fn non_empty(field: &str, value: String) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidInput(format!("{} cannot be empty", field)));
    }
    Ok(trimmed.to_string())
}

/// Any record the engine can push.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    User(User),
    Patient(Patient),
    Scan(Scan),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::User(_) => EntityKind::User,
            Record::Patient(_) => EntityKind::Patient,
            Record::Scan(_) => EntityKind::Scan,
        }
    }

    pub fn id(&self) -> RecordId {
        match self {
            Record::User(u) => u.id,
            Record::Patient(p) => p.id,
            Record::Scan(s) => s.id,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            Record::User(u) => u.revision,
            Record::Patient(p) => p.revision,
            Record::Scan(s) => s.revision,
        }
    }

    pub fn sync(&self) -> SyncFlag {
        match self {
            Record::User(u) => u.sync,
            Record::Patient(p) => p.sync,
            Record::Scan(s) => s.sync,
        }
    }

    /// Key the remote side deduplicates this record by.
    pub fn natural_key(&self) -> String {
        match self {
            Record::User(u) => u.email.as_str().to_string(),
            Record::Patient(p) => p.record_number.clone(),
            Record::Scan(s) => s.sync_key.to_string(),
        }
    }

    /// Body sent to the remote mirror.
    ///
    /// Never carries the credential secret, the local id or the sync flag.
    pub fn remote_payload(&self) -> Value {
        match self {
            Record::User(u) => json!({
                "email": u.email.as_str(),
                "full_name": u.full_name,
                "organization": u.organization,
                "role": u.role,
                "created_at": u.created_at.to_rfc3339(),
            }),
            Record::Patient(p) => json!({
                "record_number": p.record_number,
                "full_name": p.full_name,
                "notes": p.notes,
                "created_at": p.created_at.to_rfc3339(),
                "updated_at": p.updated_at.to_rfc3339(),
            }),
            Record::Scan(s) => json!({
                "sync_key": s.sync_key.to_string(),
                "patient_record_number": s.patient_record_number,
                "image_ref": s.image_ref,
                "diagnosis": s.diagnosis,
                "confidence": s.confidence,
                "created_at": s.created_at.to_rfc3339(),
            }),
        }
    }
}

impl From<User> for Record {
    fn from(user: User) -> Self {
        Record::User(user)
    }
}

impl From<Patient> for Record {
    fn from(patient: Patient) -> Self {
        Record::Patient(patient)
    }
}

impl From<Scan> for Record {
    fn from(scan: Scan) -> Self {
        Record::Scan(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_user() -> User {
        User {
            id: RecordId::new(1),
            email: Email::parse("doc@clinic.org").unwrap(),
            secret: Secret::new("s3cret"),
            full_name: "Dr. Who".to_string(),
            organization: "General".to_string(),
            role: "ophthalmologist".to_string(),
            created_at: Utc::now(),
            revision: 0,
            sync: SyncFlag::Pending,
        }
    }

    #[test]
    fn test_user_payload_omits_secret() {
        let record = Record::from(sample_user());
        let payload = record.remote_payload();
        assert_eq!(payload["email"], "doc@clinic.org");
        assert!(payload.get("secret").is_none());
        assert!(!payload.to_string().contains("s3cret"));
        assert!(payload.get("id").is_none());
    }

    #[test]
    fn test_natural_keys() {
        let record = Record::from(sample_user());
        assert_eq!(record.kind(), EntityKind::User);
        assert_eq!(record.natural_key(), "doc@clinic.org");

        let now = Utc::now();
        let patient = Record::from(Patient {
            id: RecordId::new(4),
            record_number: "A100".to_string(),
            full_name: "Jane Doe".to_string(),
            notes: String::new(),
            created_at: now,
            updated_at: now,
            revision: 0,
            sync: SyncFlag::Pending,
        });
        assert_eq!(patient.natural_key(), "A100");
        assert_eq!(patient.id(), RecordId::new(4));
    }

    #[test]
    fn test_new_records_validate() {
        assert!(NewPatient::new("  ", "Jane", "").is_err());
        assert!(NewPatient::new("A1", "Jane", "").is_ok());
        assert!(NewUser::new("doc@clinic.org", Secret::new(""), "Doc", "", "").is_err());
        assert!(NewScan::new(RecordId::new(1), "", None, None).is_err());
        assert!(NewScan::new(RecordId::new(1), "file:///a.jpg", None, Some(1.5)).is_err());
        assert!(ScanUpdate { diagnosis: None, confidence: Some(f64::NAN) }.validate().is_err());
    }

    proptest! {
        #[test]
        fn prop_confidence_bounds(score in -2.0f64..3.0) {
            let accepted = validate_confidence(score).is_ok();
            prop_assert_eq!(accepted, (0.0..=1.0).contains(&score));
        }
    }
}
