use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use backon::ConstantBuilder;
use log::LevelFilter;
use serde::Deserialize;

use crate::server::MAX_CONNECTIONS_LIMIT;

pub const DEFAULT_CONFIG_FILE: &str = "config/farm-export.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub max_connections: usize, // workers allowed to run at once
    pub read_timeout_secs: u64, // how long to wait for the command byte
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub busy_timeout_ms: u64,
    pub retry_times: usize,
    pub retry_delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExportConfig {
    pub default_device_id: i64,
    pub record_count: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:5003".to_string(),
            max_connections: 64,
            read_timeout_secs: 5,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("mqtt_data.db"),
            busy_timeout_ms: 5000,
            retry_times: 3,
            retry_delay_ms: 100,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            default_device_id: 1,
            record_count: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, anyhow::Error> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if it exists, otherwise falls back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, anyhow::Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path).with_context(|| format!("Failed to load {}", path.display()))
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        if !(1..=MAX_CONNECTIONS_LIMIT).contains(&self.server.max_connections) {
            anyhow::bail!("server.max_connections must be between 1 and {MAX_CONNECTIONS_LIMIT}");
        }
        if self.server.read_timeout_secs == 0 {
            anyhow::bail!("server.read_timeout_secs must be at least 1");
        }
        self.logging.level_filter()?;
        Ok(())
    }
}

impl ServerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn retry_builder(&self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(Duration::from_millis(self.retry_delay_ms))
            .with_max_times(self.retry_times)
    }
}

impl LoggingConfig {
    pub fn level_filter(&self) -> Result<LevelFilter, anyhow::Error> {
        self.level
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid log level: {}", self.level))
    }
}
