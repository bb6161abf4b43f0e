//! Unified configuration for unicontact.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults.
//! Environment variables use the `UNICONTACT_` prefix and `__` between nesting
//! levels, e.g. `UNICONTACT_RECONCILE__MAX_PHONE_LEN=20`.
//!
//! # Example config file (unicontact.toml)
//! ```toml
//! [storage]
//! backend = "rocksdb"
//! data_dir = "/var/lib/unicontact"
//!
//! [reconcile]
//! key_locking = true
//!
//! [log]
//! filter = "unicontact_rs=debug"
//! ```

mod defaults;

pub use defaults::*;

use crate::model::ObservationLimits;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for unicontact components.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub storage: StorageConfig,
    pub reconcile: ReconcileConfig,
    pub log: LogConfig,
}

impl ServiceConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(ServiceConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("UNICONTACT_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }
}

/// Which repository implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageBackend {
    /// Process-local, lost on exit
    #[default]
    Memory,
    /// RocksDB under `data_dir`
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Data directory, required for the RocksDB backend
    pub data_dir: Option<PathBuf>,
    /// Contacts kept in the point-read cache
    pub cache_capacity: usize,
    /// Run RocksDB repair before opening
    pub repair: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            data_dir: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            repair: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub max_phone_len: usize,
    pub max_email_len: usize,
    /// Serialize requests sharing an email or phone value. When off, two
    /// concurrent first sightings of one value can both create a primary.
    pub key_locking: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_phone_len: DEFAULT_MAX_PHONE_LEN,
            max_email_len: DEFAULT_MAX_EMAIL_LEN,
            key_locking: DEFAULT_KEY_LOCKING,
        }
    }
}

impl ReconcileConfig {
    pub fn limits(&self) -> ObservationLimits {
        ObservationLimits {
            max_phone_len: self.max_phone_len,
            max_email_len: self.max_email_len,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<StorageBackend>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
