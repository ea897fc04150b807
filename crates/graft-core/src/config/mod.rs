mod database;

pub use database::{DatabaseConfig, PoolConfig, PoolSettings};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{GraftError, Result};

/// Root configuration for graft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraftConfig {
    /// Database configuration.
    pub database: DatabaseConfig,

    /// Migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

impl GraftConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        debug!("Loading configuration from {:?}", path.as_ref());
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| GraftError::Config(format!("Failed to read config file: {}", e)))?;

        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_toml(content: &str) -> Result<Self> {
        let content = substitute_env_vars(content)?;

        toml::from_str(&content)
            .map_err(|e| GraftError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Configuration with defaults for the named database.
    pub fn for_database(name: &str) -> Self {
        Self {
            database: DatabaseConfig {
                name: name.to_string(),
                ..Default::default()
            },
            migrations: MigrationsConfig::default(),
        }
    }
}

/// Sequential migration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationsConfig {
    /// Directory holding `.tql` migration files.
    #[serde(default = "default_migrations_dir")]
    pub dir: PathBuf,

    /// Refuse to run when an applied migration's statements changed.
    #[serde(default = "default_verify_checksums")]
    pub verify_checksums: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: default_migrations_dir(),
            verify_checksums: default_verify_checksums(),
        }
    }
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_verify_checksums() -> bool {
    true
}

/// Substitute `${VAR}` references with environment values. Unset variables are left as written.
fn substitute_env_vars(content: &str) -> Result<String> {
    let re = regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}")
        .map_err(|e| GraftError::Internal(format!("invalid substitution pattern: {}", e)))?;

    let mut result = content.to_string();
    for cap in re.captures_iter(content) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }

    Ok(result)
}
