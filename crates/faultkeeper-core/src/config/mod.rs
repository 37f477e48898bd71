//! Daemon configuration.
//!
//! Loaded from a TOML file; every field has a default matching the
//! standard chaos-testing deployment, so an empty file (or no file at
//! all) yields a working configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{ProxyCatalog, ProxySpec};
use crate::retry::RetryPolicy;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid TOML for this schema.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field value fails validation.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FaultkeeperConfig {
    /// Daemon runtime settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Retry policy shared by store and proxy-engine calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Managed proxies; empty means the built-in catalog.
    #[serde(default)]
    pub proxies: Vec<ProxySpec>,
}

/// Daemon runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    /// Path to the shared control database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Toxiproxy control endpoint.
    #[serde(default = "default_toxiproxy_url")]
    pub toxiproxy_url: String,

    /// Delay between reconciliation ticks.
    #[serde(default = "default_poll_interval")]
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Consecutive event failures tolerated before aborting.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Port for the health endpoint.
    #[serde(default = "default_health_port")]
    pub health_port: u16,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("state/faultkeeper.db")
}

fn default_toxiproxy_url() -> String {
    "http://toxiproxy:8474".to_string()
}

const fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

const fn default_max_consecutive_failures() -> u32 {
    5
}

const fn default_health_port() -> u16 {
    9102
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            toxiproxy_url: default_toxiproxy_url(),
            poll_interval: default_poll_interval(),
            max_consecutive_failures: default_max_consecutive_failures(),
            health_port: default_health_port(),
        }
    }
}

impl FaultkeeperConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or validated.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// The effective proxy catalog: the configured entries, or the
    /// built-in catalog when none are configured.
    #[must_use]
    pub fn catalog(&self) -> ProxyCatalog {
        if self.proxies.is_empty() {
            ProxyCatalog::default()
        } else {
            ProxyCatalog::new(self.proxies.clone())
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.daemon.toxiproxy_url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "daemon.toxiproxy_url must not be empty".to_string(),
            ));
        }
        if self.daemon.poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "daemon.poll_interval must be positive".to_string(),
            ));
        }

        let mut names: Vec<&str> = self.proxies.iter().map(|s| s.name.as_str()).collect();
        names.sort_unstable();
        let before = names.len();
        names.dedup();
        if names.len() != before {
            return Err(ConfigError::Invalid(
                "proxy names must be unique".to_string(),
            ));
        }
        Ok(())
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
