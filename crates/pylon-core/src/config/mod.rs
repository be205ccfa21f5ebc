//! Static process configuration with layered loading.
//!
//! Configuration is loaded in this order (later overrides earlier):
//!
//! 1. **Compiled defaults**: hardcoded in the `default_*` functions below
//! 2. **Config file**: YAML file specified by `PYLON_CONFIG` (default `config.yaml`)
//! 3. **Environment variables**: `PYLON_*` variables override specific fields
//!    (e.g. `PYLON_SERVER__PROXY_PORT=9000`)
//!
//! Static configuration requires a process restart to change. Everything that
//! is tunable at runtime (downstream address, caps, queue and SSE settings)
//! lives in the dynamic policy instead; see [`crate::policy`].

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// HTTP listener configuration for the proxy and admin ports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address both listeners bind to. Defaults to `0.0.0.0`.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port for the client-facing proxy. Defaults to `8000`.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// Port for the management API. Defaults to `8001`.
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            proxy_port: default_proxy_port(),
            admin_port: default_admin_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_proxy_port() -> u16 {
    8000
}

fn default_admin_port() -> u16 {
    8001
}

/// SQLite database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL. Defaults to `sqlite://./data/pylon.db`.
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: default_database_url() }
    }
}

fn default_database_url() -> String {
    "sqlite://./data/pylon.db".to_string()
}

/// Management API authentication settings.
///
/// `password_hash` is the hex SHA-256 of the admin password; login compares
/// against it and issues a signed bearer token valid for `token_ttl_hours`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    /// Hex-encoded SHA-256 hash of the admin password. Empty disables login.
    #[serde(default)]
    pub password_hash: String,

    /// Secret used to sign admin bearer tokens. Empty disables login.
    #[serde(default)]
    pub token_secret: String,

    /// Token lifetime in hours. Defaults to `24`.
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            password_hash: String::new(),
            token_secret: String::new(),
            token_ttl_hours: default_token_ttl_hours(),
        }
    }
}

fn default_token_ttl_hours() -> u64 {
    24
}

/// Application logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g. "trace", "debug", "info", "warn", "error"). Defaults to `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `"json"` or `"pretty"`. Defaults to `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: default_log_format() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Top-level static configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from an optional YAML file plus `PYLON_*`
    /// environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be parsed or validation
    /// fails.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("PYLON")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let app: AppConfig = settings.try_deserialize()?;
        app.validate()?;
        Ok(app)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.proxy_port == 0 {
            return Err(ConfigError::Invalid("server.proxy_port must be non-zero".into()));
        }
        if self.server.admin_port == 0 {
            return Err(ConfigError::Invalid("server.admin_port must be non-zero".into()));
        }
        if self.server.proxy_port == self.server.admin_port {
            return Err(ConfigError::Invalid(
                "server.proxy_port and server.admin_port must differ".into(),
            ));
        }
        if self.database.url.is_empty() {
            return Err(ConfigError::Invalid("database.url must not be empty".into()));
        }
        match self.logging.format.as_str() {
            "json" | "pretty" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "logging.format must be \"json\" or \"pretty\", got \"{other}\""
                )))
            }
        }
        Ok(())
    }
}
