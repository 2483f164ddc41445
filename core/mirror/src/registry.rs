//! Mirror registry for resolving a remote mirror from configuration.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use ocuscan_common::{Error, Result};

use crate::directory::DirectoryMirror;
use crate::memory::MemoryMirror;
use crate::mirror::RemoteMirror;

/// Factory function type for creating mirrors.
pub type MirrorFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteMirror>> + Send + Sync>;

/// Registry for remote mirror factories.
///
/// Allows dynamic registration and resolution of mirrors by name and
/// configuration.
pub struct MirrorRegistry {
    factories: HashMap<String, MirrorFactory>,
}

impl MirrorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Create a registry with the built-in mirrors (`memory`, `directory`).
    pub fn with_defaults() -> Self {
        let mut factories: HashMap<String, MirrorFactory> = HashMap::new();

        factories.insert(
            "memory".to_string(),
            Box::new(|_config| {
                let mirror: Arc<dyn RemoteMirror> = Arc::new(MemoryMirror::new());
                Ok(mirror)
            }),
        );

        factories.insert(
            "directory".to_string(),
            Box::new(|config| {
                let root = config.get("root").and_then(|v| v.as_str()).ok_or_else(|| {
                    Error::InvalidInput("Directory mirror requires 'root' path".to_string())
                })?;
                let mirror: Arc<dyn RemoteMirror> = Arc::new(DirectoryMirror::new(root)?);
                Ok(mirror)
            }),
        );

        Self { factories }
    }

    /// Register a mirror factory.
    ///
    /// # Errors
    /// - Returns `InvalidInput` if the name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: MirrorFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::InvalidInput(format!(
                "Mirror '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a mirror by name and configuration.
    ///
    /// # Errors
    /// - Mirror not registered
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteMirror>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Mirror '{}' is not registered", name)))?;
        factory(config)
    }

    /// Names of registered mirrors, sorted.
    pub fn mirrors(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for MirrorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
