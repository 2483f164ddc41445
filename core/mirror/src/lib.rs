//! Remote mirror boundary for the OcuScan sync engine.
//!
//! This module provides a trait-based interface to the remote backend the
//! engine mirrors local records into, plus an in-memory mirror for tests, a
//! directory-backed mirror for development and a registry for resolving one
//! from configuration.
//!
//! # Design Principles
//! - Idempotent writes: every upsert is keyed by the record's natural key
//! - Async operations: every call is a potential suspension point
//! - Unified error semantics: `RemoteUnavailable`, `RemoteRejected`, `AuthRequired`

pub mod directory;
pub mod memory;
pub mod mirror;
pub mod registry;

pub use directory::DirectoryMirror;
pub use memory::{MemoryMirror, MirrorCall};
pub use mirror::{RemoteIdentity, RemoteMirror, RemoteRecord};
pub use registry::{MirrorFactory, MirrorRegistry};
