//! Common types used throughout the sync engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Local identity of a stored record.
///
/// Assigned by the local store on insert and never sent to the remote mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(i64);

impl RecordId {
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The three kinds of entity the engine keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    User,
    Patient,
    Scan,
}

impl EntityKind {
    /// Order in which a sync run pushes entity kinds.
    ///
    /// Patient and scan pushes are attributed to the user's remote identity,
    /// so users always go first.
    pub const SYNC_ORDER: [EntityKind; 3] = [EntityKind::User, EntityKind::Patient, EntityKind::Scan];

    /// Local table holding records of this kind.
    pub fn table(&self) -> &'static str {
        match self {
            EntityKind::User => "users",
            EntityKind::Patient => "patients",
            EntityKind::Scan => "scans",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Patient => "patient",
            EntityKind::Scan => "scan",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a record has been confirmed present in the remote mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncFlag {
    /// Not yet confirmed upserted to the remote mirror.
    Pending,
    /// Confirmed upserted to the remote mirror.
    Synced,
}

impl SyncFlag {
    /// Column value persisted by the local store.
    pub fn to_db(self) -> i64 {
        match self {
            SyncFlag::Pending => 0,
            SyncFlag::Synced => 1,
        }
    }

    /// Decode the persisted column. Anything non-zero counts as synced.
    pub fn from_db(value: i64) -> Self {
        if value == 0 {
            SyncFlag::Pending
        } else {
            SyncFlag::Synced
        }
    }

    pub fn is_pending(&self) -> bool {
        *self == SyncFlag::Pending
    }
}

/// A normalised email address.
///
/// The normalised form is the user's natural key on the remote side, so two
/// spellings differing only in case or surrounding whitespace are the same user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Email(String);

impl Email {
    /// Parse and normalise an email address.
    ///
    /// # Errors
    /// - Returns `InvalidInput` unless the address has exactly one `@` with
    ///   non-empty text on both sides and no inner whitespace.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        let normalised = raw.trim().to_lowercase();
        let mut parts = normalised.split('@');
        let valid = match (parts.next(), parts.next(), parts.next()) {
            (Some(local), Some(domain), None) => !local.is_empty() && !domain.is_empty(),
            _ => false,
        };
        if !valid || normalised.chars().any(char::is_whitespace) {
            return Err(crate::Error::InvalidInput(format!(
                "Invalid email address: {:?}",
                raw
            )));
        }
        Ok(Self(normalised))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Email {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<Email> for String {
    fn from(email: Email) -> Self {
        email.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Credential secret that zeroizes on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Expose the secret value. Callers must not log it.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Constant-time comparison against a candidate secret.
    pub fn matches(&self, candidate: &Secret) -> bool {
        self.0.as_bytes().ct_eq(candidate.0.as_bytes()).into()
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.matches(other)
    }
}

impl Eq for Secret {}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_email_normalisation() {
        let email = Email::parse("  Jane.Doe@Clinic.ORG ").unwrap();
        assert_eq!(email.as_str(), "jane.doe@clinic.org");
    }

    #[test]
    fn test_email_rejects_malformed() {
        assert!(Email::parse("").is_err());
        assert!(Email::parse("no-at-sign").is_err());
        assert!(Email::parse("@clinic.org").is_err());
        assert!(Email::parse("jane@").is_err());
        assert!(Email::parse("a@b@c").is_err());
        assert!(Email::parse("jane doe@clinic.org").is_err());
    }

    #[test]
    fn test_sync_flag_column() {
        assert_eq!(SyncFlag::from_db(SyncFlag::Pending.to_db()), SyncFlag::Pending);
        assert_eq!(SyncFlag::from_db(SyncFlag::Synced.to_db()), SyncFlag::Synced);
        assert_eq!(SyncFlag::from_db(7), SyncFlag::Synced);
    }

    #[test]
    fn test_sync_order() {
        assert_eq!(
            EntityKind::SYNC_ORDER,
            [EntityKind::User, EntityKind::Patient, EntityKind::Scan]
        );
        assert_eq!(EntityKind::Scan.table(), "scans");
    }

    #[test]
    fn test_secret_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret([REDACTED])");
        assert!(secret.matches(&Secret::new("hunter2")));
        assert!(!secret.matches(&Secret::new("hunter3")));
    }

    proptest! {
        #[test]
        fn prop_email_parse_idempotent(local in "[A-Za-z0-9._]{1,16}", domain in "[A-Za-z0-9.]{1,16}") {
            let raw = format!(" {}@{} ", local, domain);
            let once = Email::parse(&raw).unwrap();
            let twice = Email::parse(once.as_str()).unwrap();
            prop_assert_eq!(once, twice);
        }
    }
}
