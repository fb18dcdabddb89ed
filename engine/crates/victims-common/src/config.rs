//! Configuration management for the victims database

use serde::{Deserialize, Serialize};
use std::path::Path;
use victims_core::{DuplicatePolicy, Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Remote victims service
    #[serde(default)]
    pub service: ServiceConfig,

    /// Local database settings
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Enforcement rule settings
    #[serde(default)]
    pub rule: RuleConfig,

    /// Synchronization settings
    #[serde(default)]
    pub sync: SyncConfig,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::Configuration(format!("Failed to parse config: {}", e)))
    }

    /// Create a configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Merge with environment variables (VICTIMS_ prefix)
    pub fn merge_env(self) -> Result<Self> {
        self.merge_vars(|key| std::env::var(key).ok())
    }

    fn merge_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(val) = var("VICTIMS_URL") {
            self.service.url = val;
        }
        if let Some(val) = var("VICTIMS_DB_PATH") {
            self.database.path = val;
        }
        if let Some(val) = var("VICTIMS_TOLERANCE") {
            self.rule.tolerance = val.parse().map_err(|_| Error::InvalidConfig {
                key: String::from("VICTIMS_TOLERANCE"),
                message: format!("'{}' is not a number", val),
            })?;
        }
        if let Some(val) = var("VICTIMS_UPDATES") {
            self.rule.updates = match val.to_ascii_lowercase().as_str() {
                "auto" => UpdateMode::Auto,
                "offline" => UpdateMode::Offline,
                _ => {
                    return Err(Error::InvalidConfig {
                        key: String::from("VICTIMS_UPDATES"),
                        message: format!("'{}' is not one of auto, offline", val),
                    })
                }
            };
        }
        if let Some(val) = var("VICTIMS_DUPLICATES") {
            self.sync.duplicates = val.parse()?;
        }

        // Logging
        if let Some(val) = var("VICTIMS_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = var("VICTIMS_LOG_FORMAT") {
            self.logging.format = val;
        }

        Ok(self)
    }

    /// Validate the settings that cannot be expressed through types alone
    pub fn validate(&self) -> Result<()> {
        let raw = self.service.url.trim();
        if raw.is_empty() {
            return Err(Error::MissingConfig {
                key: String::from("service.url"),
            });
        }

        let url = url::Url::parse(raw).map_err(|e| Error::InvalidConfig {
            key: String::from("service.url"),
            message: format!("{}: {}", raw, e),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::InvalidConfig {
                key: String::from("service.url"),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if !url.path().trim_end_matches('/').ends_with("service/v1") {
            return Err(Error::InvalidConfig {
                key: String::from("service.url"),
                message: format!("{} does not point at a service/v1 endpoint", raw),
            });
        }

        if !(0.0..=1.0).contains(&self.rule.tolerance) {
            return Err(Error::InvalidConfig {
                key: String::from("rule.tolerance"),
                message: format!("{} is outside [0, 1]", self.rule.tolerance),
            });
        }

        Ok(())
    }
}

/// Remote service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Base URL of the victims service, ending in `service/v1`
    #[serde(default = "default_url")]
    pub url: String,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u32,
}

fn default_url() -> String {
    String::from("https://victims-websec.rhcloud.com/service/v1")
}

fn default_request_timeout() -> u32 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            request_timeout_seconds: 30,
        }
    }
}

/// Local database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    String::from(".victims/victims.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// How a rule reacts to a match
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Warning,
    Fatal,
    Disabled,
}

impl Mode {
    /// Should a match fail the build
    pub fn is_fatal(&self) -> bool {
        matches!(self, Mode::Fatal)
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self, Mode::Disabled)
    }
}

/// Whether the local database is refreshed before use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    #[default]
    Auto,
    Offline,
}

/// Enforcement rule configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Reaction to metadata (coordinate/manifest) matches
    #[serde(default = "default_metadata_mode")]
    pub metadata: Mode,

    /// Reaction to fingerprint (digest) matches
    #[serde(default = "default_fingerprint_mode")]
    pub fingerprint: Mode,

    /// Fraction of candidate file digests a fuzzy match must hit
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,

    #[serde(default)]
    pub updates: UpdateMode,

    /// Also match on extended metadata properties
    #[serde(default)]
    pub metadata_plus: bool,
}

fn default_metadata_mode() -> Mode {
    Mode::Warning
}

fn default_fingerprint_mode() -> Mode {
    Mode::Fatal
}

fn default_tolerance() -> f64 {
    0.75
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            metadata: Mode::Warning,
            fingerprint: Mode::Fatal,
            tolerance: 0.75,
            updates: UpdateMode::Auto,
            metadata_plus: false,
        }
    }
}

impl RuleConfig {
    pub fn updates_enabled(&self) -> bool {
        self.updates == UpdateMode::Auto
    }
}

/// Synchronization configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Treatment of update entries whose coordinates are already stored
    #[serde(default)]
    pub duplicates: DuplicatePolicy,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    String::from("info")
}

fn default_log_format() -> String {
    String::from("pretty")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: String::from("pretty"),
        }
    }
}

/// Builder for constructing Config
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.config.service.url = url.into();
        self
    }

    pub fn database_path(mut self, path: impl Into<String>) -> Self {
        self.config.database.path = path.into();
        self
    }

    pub fn tolerance(mut self, tolerance: f64) -> Self {
        self.config.rule.tolerance = tolerance;
        self
    }

    pub fn offline(mut self) -> Self {
        self.config.rule.updates = UpdateMode::Offline;
        self
    }

    pub fn duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.config.sync.duplicates = policy;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
