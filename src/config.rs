// ⚙️ Configuration - storage areas, connections, load strategies and logging
// Loaded from TOML; every section has defaults

use crate::error::{PipelineError, Result};
use crate::schema::LoadStrategy;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

pub const DEFAULT_CONFIG_PATH: &str = "pipeline.toml";
pub const CONFIG_ENV_VAR: &str = "PIPELINE_CONFIG";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub landing_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub state_dir: PathBuf,
    /// Key of the watermark document inside `state_dir`
    pub watermark_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            landing_dir: PathBuf::from("data/landing"),
            processed_dir: PathBuf::from("data/processed"),
            state_dir: PathBuf::from("data/state"),
            watermark_key: "update_tracking.json".to_string(),
        }
    }
}

/// A SQLite database file plus its busy timeout
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    30
}

impl DatabaseConfig {
    fn at(path: &str) -> Self {
        DatabaseConfig {
            path: PathBuf::from(path),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Per-table override of the default load strategy
    pub strategies: HashMap<String, LoadStrategy>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}

impl LoggingConfig {
    /// Install the global subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        // A subscriber may already be installed (tests, embedding); keep that one
        let _ = match self.format.as_str() {
            "json" => fmt().json().with_env_filter(filter).try_init(),
            _ => fmt().with_env_filter(filter).try_init(),
        };
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_source")]
    pub source: DatabaseConfig,
    #[serde(default = "default_warehouse")]
    pub warehouse: DatabaseConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_source() -> DatabaseConfig {
    DatabaseConfig::at("data/source.db")
}

fn default_warehouse() -> DatabaseConfig {
    DatabaseConfig::at("data/warehouse.db")
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: StorageConfig::default(),
            source: default_source(),
            warehouse: default_warehouse(),
            load: LoadConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn parse_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| PipelineError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| PipelineError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse_toml(&text)
    }

    /// Explicit path, then `PIPELINE_CONFIG`, then `pipeline.toml`.
    ///
    /// Only the implicit default may be absent, in which case defaults apply.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            return Self::load(Path::new(&path));
        }

        let default = Path::new(DEFAULT_CONFIG_PATH);
        if default.exists() {
            Self::load(default)
        } else {
            Ok(Config::default())
        }
    }
}
