//! # dcache-config
//!
//! Configuration management for dcache.
//!
//! Loads configuration from:
//! 1. `~/.dcache/config.toml` (global)
//! 2. `.dcache/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod path;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub locking: LockingConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config (~/.dcache/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Project config (.dcache/config.toml) overrides global
        let project_path = Path::new(".dcache/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            config.merge(Self::from_file(project_path)?);
        }

        // 3. Environment overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Load a single config file, without consulting the standard locations.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.dcache/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".dcache/config.toml"))
    }

    /// Merge another config on top of this one.
    ///
    /// A section value only overrides when it differs from the built-in default,
    /// so a project file that sets one key leaves the rest of the global file intact.
    pub fn merge(&mut self, other: Config) {
        let defaults = Config::default();

        if other.storage.root != defaults.storage.root {
            self.storage.root = other.storage.root;
        }
        if other.storage.shards != defaults.storage.shards {
            self.storage.shards = other.storage.shards;
        }
        if other.storage.create_dirs != defaults.storage.create_dirs {
            self.storage.create_dirs = other.storage.create_dirs;
        }
        if other.locking.timeout_secs != defaults.locking.timeout_secs {
            self.locking.timeout_secs = other.locking.timeout_secs;
        }
        if other.locking.initial_backoff_ms != defaults.locking.initial_backoff_ms {
            self.locking.initial_backoff_ms = other.locking.initial_backoff_ms;
        }
        if other.locking.max_backoff_ms != defaults.locking.max_backoff_ms {
            self.locking.max_backoff_ms = other.locking.max_backoff_ms;
        }
        if other.logging.level != defaults.logging.level {
            self.logging.level = other.logging.level;
        }
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("DCACHE_ROOT") {
            self.storage.root = PathBuf::from(path);
        }
        if let Ok(timeout) = std::env::var("DCACHE_TIMEOUT") {
            if let Ok(secs) = timeout.parse() {
                self.locking.timeout_secs = secs;
            }
        }
        if let Ok(flag) = std::env::var("DCACHE_CREATE_DIRS") {
            self.storage.create_dirs = matches!(flag.as_str(), "1" | "true" | "yes");
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Config::default())
    }
}

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Cache root directory, usually on a shared mount
    pub root: PathBuf,
    /// Half-open hex digit ranges of the key digest, one directory level each
    pub shards: Vec<(usize, usize)>,
    /// Pre-create every shard directory when a store is opened
    pub create_dirs: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("~/.dcache/cache"),
            shards: vec![(0, 2), (2, 4)],
            create_dirs: false,
        }
    }
}

impl StorageConfig {
    /// Root with a leading `~/` expanded to the home directory.
    pub fn resolved_root(&self) -> PathBuf {
        path::expand_home(&self.root)
    }
}

/// Lock wait configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// How long `get` polls for a shared lock before reporting a miss
    pub timeout_secs: u64,
    /// First sleep between shared lock attempts
    pub initial_backoff_ms: u64,
    /// Ceiling for the doubling sleep
    pub max_backoff_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 600,
            initial_backoff_ms: 1000,
            max_backoff_ms: 10_000,
        }
    }
}

impl LockingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset: error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn log_level(&self) -> logging::LogLevel {
        logging::LogLevel::parse(&self.level).unwrap_or(logging::LogLevel::Info)
    }
}
