//! Configuration loading and typed config structures for the storage layer.
//!
//! The canonical configuration lives in `symbiont-config.yaml` at the project
//! root. This module defines strongly-typed structs that mirror the YAML
//! structure and a loader that reads the file and applies environment
//! overrides. Every field has a default, so an empty file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use symbiont_store::StoreConfig;

use crate::role::ContextKind;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// An environment override carried an unusable value.
    #[error("invalid value for {var}: {value}")]
    InvalidEnv {
        /// The environment variable.
        var: &'static str,
        /// The rejected value.
        value: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level storage layer configuration.
///
/// Mirrors the structure of `symbiont-config.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SyncConfig {
    /// Which execution context this process plays.
    #[serde(default)]
    pub context: ContextKind,

    /// Embedded database location (owner only).
    #[serde(default)]
    pub storage: StoreConfig,

    /// Message channel settings.
    #[serde(default)]
    pub channel: ChannelConfig,

    /// Write debouncer timings.
    #[serde(default)]
    pub debounce: DebounceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SyncConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// Environment variables override YAML values:
    /// - `SYMBIONT_CONTEXT` overrides `context`
    /// - `SYMBIONT_DB_PATH` overrides `storage.path`
    /// - `NATS_URL` overrides `channel.nats_url`
    /// - `SYMBIONT_REQUEST_TIMEOUT_MS` overrides `channel.request_timeout_ms`
    /// - `SYMBIONT_DEBOUNCE_MS` overrides `debounce.window_ms`
    /// - `SYMBIONT_MAX_PENDING_MS` overrides `debounce.max_pending_ms`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read,
    /// [`ConfigError::Yaml`] if the content is not valid YAML, or
    /// [`ConfigError::InvalidEnv`] if an override cannot be parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let mut config = Self::parse(&contents)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(yaml)?)
    }

    /// Override fields with environment variables when set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] for unparsable values.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup("SYMBIONT_CONTEXT") {
            self.context = val.parse().map_err(|()| ConfigError::InvalidEnv {
                var: "SYMBIONT_CONTEXT",
                value: val.clone(),
            })?;
        }
        if let Some(val) = lookup("SYMBIONT_DB_PATH") {
            self.storage.path = PathBuf::from(val);
        }
        if let Some(val) = lookup("NATS_URL") {
            self.channel.nats_url = val;
        }
        if let Some(val) = lookup("SYMBIONT_REQUEST_TIMEOUT_MS") {
            self.channel.request_timeout_ms = parse_millis("SYMBIONT_REQUEST_TIMEOUT_MS", val)?;
        }
        if let Some(val) = lookup("SYMBIONT_DEBOUNCE_MS") {
            self.debounce.window_ms = parse_millis("SYMBIONT_DEBOUNCE_MS", val)?;
        }
        if let Some(val) = lookup("SYMBIONT_MAX_PENDING_MS") {
            self.debounce.max_pending_ms = parse_millis("SYMBIONT_MAX_PENDING_MS", val)?;
        }
        Ok(())
    }
}

fn parse_millis(var: &'static str, value: String) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .ok()
        .ok_or_else(|| ConfigError::InvalidEnv { var, value })
}

/// Message channel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChannelConfig {
    /// NATS messaging URL used by multi-process deployments.
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// Subject prefix; requests travel on `{prefix}.{type}`.
    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,

    /// How long a proxy waits for a response before giving up.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long a starting context waits for an existing owner to answer a
    /// presence probe. Zero disables the probe.
    #[serde(default = "default_owner_probe_timeout_ms")]
    pub owner_probe_timeout_ms: u64,
}

impl ChannelConfig {
    /// The request timeout as a [`Duration`].
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// The presence probe timeout, or `None` when probing is disabled.
    pub const fn owner_probe_timeout(&self) -> Option<Duration> {
        if self.owner_probe_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.owner_probe_timeout_ms))
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            nats_url: default_nats_url(),
            subject_prefix: default_subject_prefix(),
            request_timeout_ms: default_request_timeout_ms(),
            owner_probe_timeout_ms: default_owner_probe_timeout_ms(),
        }
    }
}

/// Write debouncer timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DebounceConfig {
    /// Quiet period after the latest write before it is flushed.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Longest a queued write may wait, however often it is overwritten.
    #[serde(default = "default_max_pending_ms")]
    pub max_pending_ms: u64,
}

impl DebounceConfig {
    /// The debounce window as a [`Duration`].
    pub const fn window(self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The staleness ceiling as a [`Duration`].
    pub const fn max_pending(self) -> Duration {
        Duration::from_millis(self.max_pending_ms)
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_pending_ms: default_max_pending_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_nats_url() -> String {
    String::from("nats://localhost:4222")
}

fn default_subject_prefix() -> String {
    String::from("symbiont.storage")
}

const fn default_request_timeout_ms() -> u64 {
    30_000
}

const fn default_owner_probe_timeout_ms() -> u64 {
    500
}

const fn default_window_ms() -> u64 {
    2_000
}

const fn default_max_pending_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    String::from("info")
}

/// Location of the configuration file, relative to the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("symbiont-config.yaml")
}
