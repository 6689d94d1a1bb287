use crate::error::{KeylockError, Result};
use crate::locking::timeout::LockTimeoutValue;
use crate::locking::wait_strategy::WaitStrategyKind;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "keylock.toml";
pub const ENV_PREFIX: &str = "KEYLOCK";
pub const LOCK_TIMEOUT_ENV: &str = "KEYLOCK_LOCK_TIMEOUT";

const DEFAULT_LEASE_MS: u64 = 30_000;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_BACKOFF_INITIAL_MS: u64 = 5;
const DEFAULT_SHARDS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct KeylockConfig {
    #[serde(default)]
    pub locking: LockingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockingConfig {
    /// Lease applied when a request does not name one.
    #[serde(default = "default_lease_ms")]
    pub default_lease_ms: u64,

    #[serde(default = "default_timeout")]
    pub timeout: LockTimeoutValue,

    /// Longest sleep between re-checks of a contended key.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    #[serde(default)]
    pub wait_strategy: WaitStrategyKind,

    #[serde(default = "default_shards")]
    pub shards: usize,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            default_lease_ms: DEFAULT_LEASE_MS,
            timeout: default_timeout(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            backoff_initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            wait_strategy: WaitStrategyKind::default(),
            shards: DEFAULT_SHARDS,
        }
    }
}

fn default_lease_ms() -> u64 {
    DEFAULT_LEASE_MS
}

fn default_timeout() -> LockTimeoutValue {
    LockTimeoutValue::from_secs(DEFAULT_TIMEOUT_SECS)
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_backoff_initial_ms() -> u64 {
    DEFAULT_BACKOFF_INITIAL_MS
}

fn default_shards() -> usize {
    DEFAULT_SHARDS
}

impl LockingConfig {
    pub fn default_lease(&self) -> Duration {
        Duration::from_millis(self.default_lease_ms)
    }

    pub fn timeout(&self) -> LockTimeoutValue {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shards == 0 {
            return Err(KeylockError::InvalidConfig(
                "locking.shards must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(KeylockError::InvalidConfig(
                "locking.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.default_lease_ms == 0 {
            return Err(KeylockError::InvalidConfig(
                "locking.default_lease_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// `$XDG_CONFIG_HOME/keylock/keylock.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("keylock").join(CONFIG_FILE_NAME))
}

impl KeylockConfig {
    /// Loads configuration from `path` (required when given) or from the
    /// default location (optional), then applies `KEYLOCK_*` overrides such as
    /// `KEYLOCK_LOCKING__SHARDS=32`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(KeylockError::ConfigError(format!(
                        "Config file not found at {}",
                        path.display()
                    )));
                }
                log::debug!("Loading config from {path:?}");
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            None => {
                if let Some(default_path) = default_config_path() {
                    log::debug!("Looking for optional config at {default_path:?}");
                    builder = builder.add_source(
                        File::from(default_path)
                            .format(FileFormat::Toml)
                            .required(false),
                    );
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let config: KeylockConfig = builder
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| KeylockError::ConfigError(format!("Failed to load configuration: {e}")))?;

        config.locking.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: KeylockConfig = toml::from_str(contents)
            .map_err(|e| KeylockError::ConfigError(format!("Failed to parse {CONFIG_FILE_NAME}: {e}")))?;
        config.locking.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| KeylockError::ConfigError(format!("Failed to serialize config: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, self.to_toml_string()?)?;
        log::debug!("Saved config to {path:?}");
        Ok(())
    }
}
