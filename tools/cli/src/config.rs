//! CLI configuration file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use ocuscan_store::StoreConfig;
use ocuscan_sync::SyncConfig;

/// Remote mirror selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorSettings {
    /// Registered provider name.
    pub provider: String,
    /// Provider-specific configuration.
    pub config: serde_json::Value,
}

/// Reachability probe used by `watch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// `host:port` a TCP connection is attempted to.
    pub address: String,
    pub interval_secs: u64,
    pub timeout_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            address: "1.1.1.1:443".to_string(),
            interval_secs: 5,
            timeout_ms: 1_500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: PathBuf,
    pub mirror: MirrorSettings,
    pub store: StoreConfig,
    pub sync: SyncConfig,
    pub probe: ProbeConfig,
}

impl AppConfig {
    /// Defaults rooted at `data_dir`.
    pub fn rooted_at(data_dir: &Path) -> Self {
        Self {
            database: data_dir.join("ocuscan.db"),
            mirror: MirrorSettings {
                provider: "directory".to_string(),
                config: serde_json::json!({
                    "root": data_dir.join("mirror").to_string_lossy()
                }),
            },
            store: StoreConfig::default(),
            sync: SyncConfig::default(),
            probe: ProbeConfig::default(),
        }
    }

    /// Read a config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load `path` if given, else the default config file if present,
    /// else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = default_config_path();
                if default_path.exists() {
                    Self::load(&default_path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::rooted_at(&default_data_dir())
    }
}

impl Default for MirrorSettings {
    fn default() -> Self {
        AppConfig::rooted_at(&default_data_dir()).mirror
    }
}

/// Platform data directory for OcuScan.
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocuscan")
}

pub fn default_config_path() -> PathBuf {
    default_data_dir().join("config.json")
}
