//! Global configuration parsing and validation.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::protocol::TransportMode;
use crate::{AppError, Result};

/// Configurable timeout values (seconds) for client operations.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Catalog fetch timeout.
    #[serde(default = "default_catalog_seconds")]
    pub catalog_seconds: u64,
    /// Overall wall-clock budget for one run.
    #[serde(default = "default_run_seconds")]
    pub run_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            catalog_seconds: default_catalog_seconds(),
            run_seconds: default_run_seconds(),
        }
    }
}

impl TimeoutConfig {
    /// Catalog fetch timeout as a [`Duration`].
    #[must_use]
    pub fn catalog(&self) -> Duration {
        Duration::from_secs(self.catalog_seconds)
    }

    /// Run budget as a [`Duration`].
    #[must_use]
    pub fn run(&self) -> Duration {
        Duration::from_secs(self.run_seconds)
    }
}

fn default_catalog_seconds() -> u64 {
    10
}

fn default_run_seconds() -> u64 {
    120
}

fn default_endpoint() -> String {
    "ws://127.0.0.1:8000/api/ws".into()
}

fn default_list_id() -> String {
    "global".into()
}

/// Global configuration parsed from `config.toml`.
///
/// Every field has a default, so a missing config file means "talk to a
/// local server with server-side defaults". CLI flags override file values.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// WebSocket endpoint of the `DnsCheck` server.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Provider list selected when the caller does not name one.
    #[serde(default = "default_list_id")]
    pub default_list_id: String,
    /// Resolver transport mode selected when the caller does not name one.
    #[serde(default)]
    pub default_transport: TransportMode,
    /// Timeout configuration.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            default_list_id: default_list_id(),
            default_transport: TransportMode::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with("ws://") && !self.endpoint.starts_with("wss://") {
            return Err(AppError::Config(format!(
                "endpoint `{}` must be a ws:// or wss:// URL",
                self.endpoint
            )));
        }
        if self.default_list_id.trim().is_empty() {
            return Err(AppError::Config("default_list_id must not be empty".into()));
        }
        if self.timeouts.catalog_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.catalog_seconds must be greater than zero".into(),
            ));
        }
        if self.timeouts.run_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.run_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
