use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokio::time::Duration;

// Parses a duration string (e.g., "250ms", "5s") into a `tokio::time::Duration`.
fn parse_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("no services configured")]
    NoServices,
}

/// [app] section.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "AppConfig::default_port")]
    pub port: u16,
}

impl AppConfig {
    fn default_port() -> u16 {
        11000
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            port: Self::default_port(),
        }
    }
}

/// [log] section.
#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "LogConfig::default_level")]
    pub level: String,
}

impl LogConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

/// [broker] section.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerConfig {
    // Records buffered per topic before publishers wait.
    #[serde(default = "BrokerConfig::default_capacity")]
    pub capacity: usize,
}

impl BrokerConfig {
    fn default_capacity() -> usize {
        1024
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
        }
    }
}

/// One [[services]] entry: a tenant's delivery pipeline and its retry policy.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub tenant_id: String,

    // Runner pool size; values below 1 are raised to 1.
    #[serde(default = "ServiceConfig::default_max_requests")]
    pub max_requests: usize,

    // Attempts per delivery.
    #[serde(default = "ServiceConfig::default_retry")]
    pub retry: u32,

    #[serde(
        default = "ServiceConfig::default_retry_delay",
        deserialize_with = "parse_duration"
    )]
    pub retry_delay: Duration,

    // Per HTTP call.
    #[serde(
        default = "ServiceConfig::default_timeout",
        deserialize_with = "parse_duration"
    )]
    pub timeout: Duration,

    pub group_id: Option<String>,
}

impl ServiceConfig {
    fn default_max_requests() -> usize {
        10
    }

    fn default_retry() -> u32 {
        3
    }

    fn default_retry_delay() -> Duration {
        Duration::from_secs(1)
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(5)
    }

    pub fn topic(&self) -> String {
        format!("{}-{}", self.tenant_id, self.name)
    }

    pub fn error_topic(&self) -> String {
        format!("{}-error", self.topic())
    }

    pub fn group_id(&self) -> &str {
        self.group_id.as_deref().unwrap_or(&self.name)
    }

    fn validate(&mut self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingParameter("name"));
        }
        if self.tenant_id.is_empty() {
            return Err(ConfigError::MissingParameter("tenant_id"));
        }
        self.max_requests = self.max_requests.max(1);
        Ok(())
    }
}

/// Application configuration, loaded from a TOML file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub services: Vec<ServiceConfig>,
}

impl Config {
    pub fn new(config_path: &Path) -> Result<Self> {
        let mut config = Self::load_from_file(config_path)?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;
        Ok(config)
    }

    fn load_from_file(config_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(config_path)?;
        toml::from_str::<Config>(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))
    }

    /// Checks required fields and normalizes pool sizes.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.services.is_empty() {
            return Err(ConfigError::NoServices);
        }
        self.services.iter_mut().try_for_each(ServiceConfig::validate)
    }
}
