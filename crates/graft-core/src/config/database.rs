use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GraftError, Result};

/// Database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Name of the database that holds the schema and the migration ledgers.
    pub name: String,

    /// Store address, passed through to the driver.
    #[serde(default = "default_address")]
    pub address: String,

    /// Create the database on startup when it does not exist.
    #[serde(default = "default_true")]
    pub create_if_missing: bool,

    /// Connection pool settings.
    #[serde(default)]
    pub pool: PoolSettings,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            address: default_address(),
            create_if_missing: true,
            pool: PoolSettings::default(),
        }
    }
}

fn default_address() -> String {
    "localhost:1729".to_string()
}

fn default_true() -> bool {
    true
}

/// Pool settings as written in the config file. Timeouts of `0` disable them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_min_size")]
    pub min_size: usize,

    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Idle connections older than this are evicted.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How long `get` blocks when the pool is exhausted.
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            idle_timeout_secs: default_idle_timeout(),
            wait_timeout_secs: default_wait_timeout(),
        }
    }
}

fn default_min_size() -> usize {
    2
}

fn default_max_size() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_wait_timeout() -> u64 {
    10
}

impl PoolSettings {
    /// Convert to a validated runtime pool configuration.
    pub fn to_pool_config(&self) -> Result<PoolConfig> {
        let config = PoolConfig {
            min_size: self.min_size,
            max_size: self.max_size,
            idle_timeout: secs_or_disabled(self.idle_timeout_secs),
            wait_timeout: secs_or_disabled(self.wait_timeout_secs),
        };
        config.validate()?;
        Ok(config)
    }
}

fn secs_or_disabled(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Runtime connection pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Connections created up front and kept through idle eviction.
    pub min_size: usize,
    /// Hard cap on open connections.
    pub max_size: usize,
    /// `None` disables idle eviction.
    pub idle_timeout: Option<Duration>,
    /// `None` waits until a connection is available or the caller cancels.
    pub wait_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: default_min_size(),
            max_size: default_max_size(),
            idle_timeout: Some(Duration::from_secs(default_idle_timeout())),
            wait_timeout: Some(Duration::from_secs(default_wait_timeout())),
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(GraftError::Config(
                "pool max_size must be at least 1".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(GraftError::Config(format!(
                "pool min_size ({}) exceeds max_size ({})",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}
