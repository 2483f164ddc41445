//! Local store for the OcuScan sync engine.
//!
//! Holds the canonical local state of users, patients and scans in SQLite,
//! together with the per-record sync flag the sync workers drive.

pub mod config;
pub mod pending;
pub mod schema;
pub mod store;

pub use config::{StoreConfig, UpdatePolicy};
pub use pending::{PendingIter, PendingSnapshot};
pub use store::{KindStatus, LocalStore};
