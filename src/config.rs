//! Configuration for the progress sync client
//!
//! Only `[broker]` is required; every other section falls back to defaults.

use crate::connection::ReconnectConfig;
use crate::progress::AggregatorConfig;
use crate::protocol::destinations::{DEFAULT_JOB_FEED_PREFIX, DEFAULT_USER_FEED};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub destinations: DestinationSection,
    #[serde(default)]
    pub progress: ProgressSection,
}

/// Broker endpoint and session settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// WebSocket endpoint, `ws://` or `wss://`
    pub url: String,
    /// Environment variable holding the bearer token
    pub token_env: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Heart-beat interval in both directions. The session is dropped when
    /// the broker stays silent for two intervals. 0 disables heart-beats.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_heartbeat_ms() -> u64 {
    10_000
}

/// Reconnect backoff settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectSection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl From<&ReconnectSection> for ReconnectConfig {
    fn from(section: &ReconnectSection) -> Self {
        Self {
            max_attempts: section.max_attempts,
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
        }
    }
}

/// Feed destinations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DestinationSection {
    pub user_feed: String,
    /// Per-job feeds are `<prefix>/<workId>`
    pub job_feed_prefix: String,
}

impl Default for DestinationSection {
    fn default() -> Self {
        Self {
            user_feed: DEFAULT_USER_FEED.to_string(),
            job_feed_prefix: DEFAULT_JOB_FEED_PREFIX.to_string(),
        }
    }
}

/// Aggregator settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProgressSection {
    pub track_items: bool,
    pub item_cache_capacity: usize,
}

impl Default for ProgressSection {
    fn default() -> Self {
        Self {
            track_items: true,
            item_cache_capacity: 1000,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal configuration for a broker URL, everything else default
    pub fn for_url(url: impl Into<String>) -> Self {
        Self {
            broker: BrokerSection {
                url: url.into(),
                token_env: None,
                connect_timeout_secs: default_connect_timeout(),
                heartbeat_ms: default_heartbeat_ms(),
            },
            reconnect: ReconnectSection::default(),
            destinations: DestinationSection::default(),
            progress: ProgressSection::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_broker_url(&self.broker.url)?;

        if self.broker.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "broker.connect_timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.reconnect_config()
            .validate()
            .map_err(|e| ConfigError::InvalidConfig(format!("reconnect: {e}")))?;

        if self.progress.item_cache_capacity == 0 {
            return Err(ConfigError::InvalidConfig(
                "progress.item_cache_capacity must be greater than 0".to_string(),
            ));
        }

        for (name, destination) in [
            ("destinations.user_feed", &self.destinations.user_feed),
            (
                "destinations.job_feed_prefix",
                &self.destinations.job_feed_prefix,
            ),
        ] {
            if destination.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must not be empty"
                )));
            }
        }

        Ok(())
    }

    pub fn reconnect_config(&self) -> ReconnectConfig {
        ReconnectConfig::from(&self.reconnect)
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        AggregatorConfig::from(&self.progress)
    }

    /// Bearer token from the configured environment variable, if set
    pub fn bearer_token(&self) -> Option<String> {
        self.broker
            .token_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

fn validate_broker_url(url: &str) -> Result<(), ConfigError> {
    let parsed = Url::parse(url)
        .map_err(|e| ConfigError::InvalidConfig(format!("broker.url '{url}' is invalid: {e}")))?;
    match parsed.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::InvalidConfig(format!(
            "broker.url must use ws:// or wss://, got {other}://"
        ))),
    }
}
