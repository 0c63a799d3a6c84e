//! Configuration loading from TOML files
//!
//! The binaries pick the file with `--config <path>`, falling back to the
//! CONFIG_FILE environment variable and then `config/badge-reader.toml`.
//!
//! Every field has a default, so a missing file is not an error. A file that
//! exists but cannot be read or parsed is a configuration failure.

use crate::domain::BadgeError;
use anyhow::Context;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/badge-reader.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct ReaderConfig {
    /// Pause between enumerations when no reader is attached (0 = none)
    #[serde(default)]
    pub empty_poll_interval_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self { empty_poll_interval_ms: 0 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct IdentityConfig {
    /// Remove a trailing 90 00 status word from the UID response
    #[serde(default)]
    pub strip_status_word: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_topic")]
    pub topic: String,
    /// Path to the key=value broker properties file
    #[serde(default = "default_properties_file")]
    pub properties_file: String,
    /// Upper bound on waiting for delivery confirmation
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// How long the delivery drain may run on after the client is closed
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
}

fn default_topic() -> String {
    "badge-reader".to_string()
}

fn default_properties_file() -> String {
    "./properties".to_string()
}

fn default_flush_timeout_ms() -> u64 {
    15_000
}

fn default_drain_grace_ms() -> u64 {
    1_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            properties_file: default_properties_file(),
            flush_timeout_ms: default_flush_timeout_ms(),
            drain_grace_ms: default_drain_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Metrics report interval (0 to disable)
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    60
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    empty_poll_interval_ms: u64,
    strip_status_word: bool,
    topic: String,
    properties_file: String,
    flush_timeout_ms: u64,
    drain_grace_ms: u64,
    metrics_interval_secs: u64,
    config_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default".to_string())
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: String) -> Self {
        Self {
            empty_poll_interval_ms: toml_config.reader.empty_poll_interval_ms,
            strip_status_word: toml_config.identity.strip_status_word,
            topic: toml_config.broker.topic,
            properties_file: toml_config.broker.properties_file,
            flush_timeout_ms: toml_config.broker.flush_timeout_ms,
            drain_grace_ms: toml_config.broker.drain_grace_ms,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            config_file,
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self::from_toml(toml_config, path.display().to_string());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, BadgeError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(config_file = %path.display(), "config_file_missing_using_defaults");
            return Ok(Self::default());
        }

        Self::from_file(path).map_err(|e| BadgeError::configuration(format!("{:#}", e)))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.topic.trim().is_empty() {
            anyhow::bail!("broker.topic must not be empty");
        }
        if self.flush_timeout_ms == 0 {
            anyhow::bail!("broker.flush_timeout_ms must be greater than zero");
        }
        Ok(())
    }

    // Getters for all config fields
    pub fn empty_poll_interval_ms(&self) -> u64 {
        self.empty_poll_interval_ms
    }

    pub fn strip_status_word(&self) -> bool {
        self.strip_status_word
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn properties_file(&self) -> &str {
        &self.properties_file
    }

    pub fn flush_timeout_ms(&self) -> u64 {
        self.flush_timeout_ms
    }

    pub fn drain_grace_ms(&self) -> u64 {
        self.drain_grace_ms
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    /// Builder method for tests and tools to override the topic
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Builder method to toggle status word stripping
    pub fn with_strip_status_word(mut self, strip: bool) -> Self {
        self.strip_status_word = strip;
        self
    }
}
