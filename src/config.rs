//! Infrastructure configuration
//!
//! Options are plain serde data. They can be built in code, parsed from JSON, or (with the
//! `config-file` feature) loaded from a file with `GATTLINK__*` environment overrides.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::ble::UnhandledErrorPolicy;
use crate::retry::RetryPolicy;

/// Default per-operation timeout
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default capacity of the event and unhandled-error channels
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// What happens to a second submission while one operation is in flight on a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Wait in a FIFO queue for the device to become free
    #[default]
    Queue,
    /// Fail immediately with `AlreadyInProgress`
    Reject,
}

/// Options recognised by the session core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfrastructureOptions {
    /// Timeout for an operation when the caller passes none
    pub default_timeout_ms: u64,
    pub submit_mode: SubmitMode,
    pub retry: RetryPolicy,
    /// Scanner stop removes disconnected devices; broadcaster stop drops its clients
    pub auto_cleanup_on_stop: bool,
    /// Removed entities run their release hook before the removing call returns
    pub auto_dispose_on_removal: bool,
    /// Reaching `Disconnected` clears the device's entity cache
    pub clear_cache_on_disconnect: bool,
    /// Reaching `Disconnected` removes the device from the scanner's list
    pub remove_device_on_disconnect: bool,
    /// Unexpected disconnects move to `Reconnecting` and retry the connection
    pub auto_reconnect: bool,
    /// Limit on simultaneously connecting/connected devices
    pub max_concurrent_connections: Option<usize>,
    /// How long a timed-out or cancelled operation's late completion is drained
    /// (defaults to the operation timeout)
    pub orphan_grace_ms: Option<u64>,
    pub unhandled_errors: UnhandledErrorPolicy,
    pub event_capacity: usize,
}

impl Default for InfrastructureOptions {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            submit_mode: SubmitMode::Queue,
            retry: RetryPolicy::default(),
            auto_cleanup_on_stop: true,
            auto_dispose_on_removal: true,
            clear_cache_on_disconnect: true,
            remove_device_on_disconnect: false,
            auto_reconnect: false,
            max_concurrent_connections: None,
            orphan_grace_ms: None,
            unhandled_errors: UnhandledErrorPolicy::Dispatch,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl InfrastructureOptions {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Grace period for late completions of abandoned operations
    pub fn orphan_grace(&self, timeout: Duration) -> Duration {
        self.orphan_grace_ms
            .map(Duration::from_millis)
            .unwrap_or(timeout)
    }

    /// Parse options from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        options.validate()?;
        Ok(options)
    }

    /// Load options from a file (any format the `config` crate understands), then apply
    /// `GATTLINK__*` environment overrides. A `.env` file is honoured if present.
    #[cfg(feature = "config-file")]
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("GATTLINK")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .map_err(|e| ConfigError::Load(e.to_string()))?;

        let options: Self = settings
            .try_deserialize()
            .map_err(|e| ConfigError::Parse(e.to_string()))?;
        options.validate()?;

        tracing::info!(
            "Loaded options from {} (timeout: {}ms, mode: {:?})",
            path.as_ref().display(),
            options.default_timeout_ms,
            options.submit_mode
        );
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "default_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_concurrent_connections == Some(0) {
            return Err(ConfigError::Invalid(
                "max_concurrent_connections must be at least 1 when set".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
