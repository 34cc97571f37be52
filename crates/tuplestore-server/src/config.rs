//! Configuration loading for the tuple store service.
//!
//! Sources, lowest precedence first:
//! 1. Built-in defaults
//! 2. A YAML file
//! 3. `TUPLESTORE_` environment variables
//!
//! # Example
//!
//! ```ignore
//! use tuplestore_server::config::ServerConfig;
//!
//! let config = ServerConfig::load("tuplestore.yaml")?;
//! // or
//! let config = ServerConfig::from_env()?;
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tuplestore_storage::{DEFAULT_CHANGES_PAGE_SIZE, DEFAULT_QUERY_TIMEOUT_SECS};

const ENV_PREFIX: &str = "TUPLESTORE";

/// Top-level service configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub changelog: ChangelogSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Backend selection and connection pool settings.
#[derive(Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageSettings {
    /// "memory", "postgres" or "mysql"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Required for "postgres" and "mysql".
    pub database_url: Option<String>,

    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,

    /// Create tables and indexes on startup.
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

// database_url may carry credentials
impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("backend", &self.backend)
            .field(
                "database_url",
                &self.database_url.as_ref().map(|_| "[REDACTED]"),
            )
            .field("pool_size", &self.pool_size)
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .field("query_timeout_secs", &self.query_timeout_secs)
            .field("run_migrations", &self.run_migrations)
            .finish()
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            database_url: None,
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
            query_timeout_secs: default_query_timeout(),
            run_migrations: true,
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_query_timeout() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

/// Change-log read settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ChangelogSettings {
    /// Changes younger than this are withheld from readers.
    #[serde(default)]
    pub horizon_offset_ms: u64,

    /// Page size used when a request does not ask for one.
    #[serde(default = "default_changes_page_size")]
    pub page_size: usize,
}

impl ChangelogSettings {
    pub fn horizon_offset(&self) -> Duration {
        Duration::from_millis(self.horizon_offset_ms)
    }
}

impl Default for ChangelogSettings {
    fn default() -> Self {
        Self {
            horizon_offset_ms: 0,
            page_size: default_changes_page_size(),
        }
    }
}

fn default_changes_page_size() -> usize {
    DEFAULT_CHANGES_PAGE_SIZE
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// "trace", "debug", "info", "warn" or "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON lines instead of pretty text.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration loading error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    /// Failed to read or parse a source.
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Values parsed but failed validation.
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl ServerConfig {
    /// Loads `path` with `TUPLESTORE_` environment overrides.
    ///
    /// Nested keys use `__`: `TUPLESTORE_STORAGE__DATABASE_URL` sets
    /// `storage.database_url`, `TUPLESTORE_CHANGELOG__HORIZON_OFFSET_MS` sets
    /// `changelog.horizon_offset_ms`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(environment())
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    /// Defaults plus `TUPLESTORE_` environment overrides.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config = Config::builder()
            .add_source(Config::try_from(&ServerConfig::default())?)
            .add_source(environment())
            .build()?;

        let server_config: ServerConfig = config.try_deserialize()?;
        server_config.validate()?;
        Ok(server_config)
    }

    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        let valid_backends = ["memory", "postgres", "mysql"];
        if !valid_backends.contains(&self.storage.backend.as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "storage.backend must be one of: {:?}, got: {}",
                    valid_backends, self.storage.backend
                ),
            });
        }

        if self.storage.backend != "memory"
            && self
                .storage
                .database_url
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "storage.database_url is required when backend is '{}'",
                    self.storage.backend
                ),
            });
        }

        if self.storage.pool_size == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "storage.pool_size must be greater than zero".to_string(),
            });
        }

        if self.changelog.page_size == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "changelog.page_size must be greater than zero".to_string(),
            });
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigLoadError::Invalid {
                message: format!(
                    "logging.level must be one of: {:?}, got: {}",
                    valid_levels, self.logging.level
                ),
            });
        }

        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
}
