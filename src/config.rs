//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage::WriteBackSettings;
use crate::visitors::day_key::{DayKeyResolver, MAX_OFFSET_MINUTES};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub counter: CounterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub http_port: u16,
    /// Directory of static files served for page requests
    pub public_dir: PathBuf,
    /// Take the client address from X-Forwarded-For / X-Real-IP when behind a proxy
    pub trust_proxy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    File,
    Document,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageKind,
    pub file_path: PathBuf,
    /// Connection URL of the shared document store (e.g. "sqlite:///var/lib/counter/db.sqlite")
    pub database_url: String,
    pub document_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CounterConfig {
    /// Minutes east of UTC used to decide which day a view belongs to
    pub tz_offset_minutes: i32,
    pub debounce_ms: u64,
    pub retry_ms: u64,
}

impl CounterConfig {
    pub fn day_key_resolver(&self) -> Result<DayKeyResolver> {
        DayKeyResolver::new(self.tz_offset_minutes).ok_or_else(|| {
            anyhow::anyhow!(
                "Invalid tz_offset_minutes {}. Must be within ±{}",
                self.tz_offset_minutes,
                MAX_OFFSET_MINUTES
            )
        })
    }

    pub fn write_back(&self) -> WriteBackSettings {
        WriteBackSettings {
            debounce: Duration::from_millis(self.debounce_ms),
            retry: Duration::from_millis(self.retry_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = "config.toml";

        let builder = Self::defaults()?
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(config::Environment::with_prefix("COUNTER").separator("__"))
            // Hosting platforms hand out the port through PORT
            .set_override_option("server.http_port", std::env::var("PORT").ok())?;

        let settings = builder.build()?;
        let config: Config = settings.try_deserialize()?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.http_port", 8080)?
            .set_default("server.public_dir", "public")?
            .set_default("server.trust_proxy", true)?
            .set_default("storage.backend", "file")?
            .set_default("storage.file_path", "visitor-data.json")?
            .set_default("storage.database_url", "")?
            .set_default("storage.document_key", "visitor-stats")?
            .set_default("counter.tz_offset_minutes", 0)?
            .set_default("counter.debounce_ms", 500)?
            .set_default("counter.retry_ms", 5000)?
            .set_default("logging.level", "info")?)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate server config
        if self.server.http_port == 0 {
            anyhow::bail!("Invalid http_port: 0 is not allowed");
        }
        if self.server.host.is_empty() {
            anyhow::bail!("Server host cannot be empty");
        }

        // Validate storage config
        if self.storage.file_path.as_os_str().is_empty() {
            anyhow::bail!("storage.file_path cannot be empty");
        }
        if self.storage.backend == StorageKind::Document && self.storage.database_url.is_empty() {
            anyhow::bail!("storage.database_url must be set when using the document backend");
        }
        if self.storage.document_key.is_empty() {
            anyhow::bail!("storage.document_key cannot be empty");
        }

        // Validate counter config
        self.counter.day_key_resolver()?;
        if self.counter.debounce_ms == 0 {
            anyhow::bail!("counter.debounce_ms must be greater than 0");
        }

        // Validate logging level
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!("Invalid logging level '{}'. Must be one of: {:?}", self.logging.level, valid_levels);
        }

        Ok(())
    }
}
