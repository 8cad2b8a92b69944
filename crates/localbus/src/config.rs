//! Namespace configuration.
//!
//! Sources are layered the same way for the library and the CLI (later sources
//! override earlier ones):
//!
//! 1. built-in defaults
//! 2. an optional configuration file (YAML, JSON or TOML by extension)
//! 3. environment variables prefixed `LOCALBUS__` with `__` as the nesting
//!    separator, e.g. `LOCALBUS__MAX_MESSAGE_SIZE=1048576`

use crate::entity::duration_secs;
use crate::error::ConfigurationError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "LOCALBUS";

/// Limits and behaviour of an in-memory namespace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Namespace name; connection strings must point at `sb://<name>.servicebus.windows.net/`
    pub name: String,

    /// Largest accepted message (and message batch) in bytes
    pub max_message_size: usize,

    /// Smallest lock duration an entity may be configured with
    #[serde(with = "duration_secs")]
    pub min_lock_duration: Duration,

    /// How often a waiting receiver re-checks for lock expiry and scheduled messages
    #[serde(with = "duration_secs")]
    pub receive_poll_interval: Duration,

    /// Longest auto-forwarding chain before messages are dead-lettered
    pub max_forward_hops: u8,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            name: "localbus".to_string(),
            max_message_size: 256 * 1024,
            min_lock_duration: Duration::seconds(5),
            receive_poll_interval: Duration::milliseconds(100),
            max_forward_hops: 4,
        }
    }
}

impl NamespaceConfig {
    /// Create configuration for the named namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Relaxed limits for tests: locks may be as short as 10ms and receivers poll every 10ms
    pub fn for_testing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            min_lock_duration: Duration::milliseconds(10),
            receive_poll_interval: Duration::milliseconds(10),
            ..Self::default()
        }
    }

    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading namespace configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded = builder
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: Self = loaded
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for internally inconsistent values
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ConfigurationError::Invalid {
                message: format!(
                    "namespace name '{}' must be non-empty ASCII letters, digits or hyphens",
                    self.name
                ),
            });
        }

        if self.max_message_size == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_message_size must be positive".to_string(),
            });
        }

        if self.min_lock_duration <= Duration::zero() {
            return Err(ConfigurationError::Invalid {
                message: "min_lock_duration must be positive".to_string(),
            });
        }

        if self.receive_poll_interval <= Duration::zero() {
            return Err(ConfigurationError::Invalid {
                message: "receive_poll_interval must be positive".to_string(),
            });
        }

        Ok(())
    }

    /// Endpoint URI of the namespace as it appears in connection strings
    pub fn endpoint(&self) -> String {
        format!("sb://{}.servicebus.windows.net/", self.name)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
