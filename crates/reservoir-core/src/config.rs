//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/reservoir/config.toml)
//! 3. Environment variables (RESERVOIR_* prefix)
//!
//! Environment variables take precedence over config file values.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::pool::PoolConfig;

/// Environment variable prefix
const ENV_PREFIX: &str = "RESERVOIR";

/// Which backing store to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Sqlite,
    Memory,
}

impl FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(BackendKind::Sqlite),
            "memory" => Ok(BackendKind::Memory),
            other => bail!("Unknown backend '{}': expected 'sqlite' or 'memory'", other),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Sqlite => f.write_str("sqlite"),
            BackendKind::Memory => f.write_str("memory"),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the main database and per-schema databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Backing store
    #[serde(default)]
    pub backend: BackendKind,

    /// Schema used when a table name carries none
    #[serde(default = "default_schema")]
    pub default_schema: String,

    /// Sessions opened when the pool starts
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Upper bound on open sessions; unbounded when unset
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Attempts per session open when the store reports a transient failure
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,

    /// Pause between connect attempts
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long a session waits on a locked SQLite database
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backend: BackendKind::default(),
            default_schema: default_schema(),
            pool_size: default_pool_size(),
            max_connections: None,
            connect_retries: default_connect_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (RESERVOIR_DATA_DIR, RESERVOIR_BACKEND, ...)
    /// 2. Config file (~/.config/reservoir/config.toml or RESERVOIR_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &PathBuf) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(val) = env_var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }

        if let Some(val) = env_var("BACKEND") {
            self.backend = val.parse()?;
        }

        if let Some(val) = env_var("DEFAULT_SCHEMA") {
            self.default_schema = val;
        }

        if let Some(val) = env_var("POOL_SIZE") {
            self.pool_size = val
                .trim()
                .parse()
                .with_context(|| format!("Invalid {}_POOL_SIZE: {:?}", ENV_PREFIX, val))?;
        }

        // Empty or 0 lifts the cap
        if let Some(val) = env_var("MAX_CONNECTIONS") {
            let max: usize = if val.trim().is_empty() {
                0
            } else {
                val.trim()
                    .parse()
                    .with_context(|| format!("Invalid {}_MAX_CONNECTIONS: {:?}", ENV_PREFIX, val))?
            };
            self.max_connections = if max == 0 { None } else { Some(max) };
        }

        Ok(())
    }

    /// Set a single key by name, as `reservoir config set` does
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "data_dir" => self.data_dir = PathBuf::from(value),
            "backend" => self.backend = value.parse()?,
            "default_schema" => self.default_schema = value.to_string(),
            "pool_size" => self.pool_size = value.parse().context("pool_size must be a number")?,
            "max_connections" => {
                let max: usize = value.parse().context("max_connections must be a number")?;
                self.max_connections = if max == 0 { None } else { Some(max) };
            }
            "connect_retries" => {
                self.connect_retries = value.parse().context("connect_retries must be a number")?
            }
            "retry_backoff_ms" => {
                self.retry_backoff_ms = value.parse().context("retry_backoff_ms must be a number")?
            }
            "busy_timeout_ms" => {
                self.busy_timeout_ms = value.parse().context("busy_timeout_ms must be a number")?
            }
            other => bail!("Unknown config key '{}'", other),
        }
        self.validate()
    }

    /// Normalise pool limits and reject a pre-grown pool larger than its cap
    ///
    /// `max_connections = 0` means no cap, as it does for the env override.
    fn validate(&mut self) -> Result<()> {
        self.max_connections = self.max_connections.filter(|&max| max > 0);
        if let Some(max) = self.max_connections {
            if self.pool_size > max {
                bail!(
                    "pool_size ({}) cannot exceed max_connections ({})",
                    self.pool_size,
                    max
                );
            }
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file_path())
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with RESERVOIR_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Some(path) = env_var("CONFIG") {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reservoir")
            .join("config.toml")
    }

    /// Get the path to the main database (readings and catalogs)
    pub fn readings_db_path(&self) -> PathBuf {
        self.data_dir.join(crate::storage::sqlite::MAIN_DATABASE)
    }

    /// Get the path to the database holding one table schema
    pub fn schema_db_path(&self, schema: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", schema))
    }

    /// Pool settings derived from this configuration
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            initial_size: self.pool_size,
            max_connections: self.max_connections,
            connect_retries: self.connect_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("{}_{}", ENV_PREFIX, suffix)).ok()
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("reservoir")
}

fn default_schema() -> String {
    "reservoir".to_string()
}

fn default_pool_size() -> usize {
    5
}

fn default_connect_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

fn default_busy_timeout_ms() -> u64 {
    5000
}
