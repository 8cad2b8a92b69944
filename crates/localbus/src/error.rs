//! Error types for broker, client and administration operations.

use crate::message::Timestamp;
use chrono::Duration;
use thiserror::Error;

/// Comprehensive error type for all messaging operations
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Messaging entity not found: {entity}")]
    EntityNotFound { entity: String },

    #[error("Messaging entity already exists: {entity}")]
    EntityAlreadyExists { entity: String },

    #[error("Message lock lost or unknown lock token: {lock_token}")]
    MessageLockLost { lock_token: String },

    #[error("Session lock lost for session '{session_id}'")]
    SessionLockLost { session_id: String },

    #[error("Session '{session_id}' is locked by another receiver until {locked_until}")]
    SessionCannotBeLocked {
        session_id: String,
        locked_until: Timestamp,
    },

    #[error("Message with sequence number {sequence_number} not found in {entity}")]
    MessageNotFound {
        entity: String,
        sequence_number: i64,
    },

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Entity '{entity}' is full: {max_size} messages")]
    QuotaExceeded { entity: String, max_size: usize },

    #[error("Unauthorized: '{key_name}' lacks the {right} claim on {entity}")]
    Unauthorized {
        key_name: String,
        right: String,
        entity: String,
    },

    #[error("Client has been closed: {entity}")]
    ClientClosed { entity: String },

    #[error("Invalid operation: {message}")]
    InvalidOperation { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Filter error: {0}")]
    FilterError(#[from] FilterError),

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl BusError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::EntityNotFound { .. } => false,
            Self::EntityAlreadyExists { .. } => false,
            Self::MessageLockLost { .. } => true,
            Self::SessionLockLost { .. } => true,
            Self::SessionCannotBeLocked { .. } => true,
            Self::MessageNotFound { .. } => false,
            Self::MessageTooLarge { .. } => false,
            Self::QuotaExceeded { .. } => true,
            Self::Unauthorized { .. } => false,
            Self::ClientClosed { .. } => false,
            Self::InvalidOperation { .. } => false,
            Self::Timeout { .. } => true,
            Self::FilterError(_) => false,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::SessionCannotBeLocked { .. } => Some(Duration::seconds(5)),
            Self::SessionLockLost { .. } => Some(Duration::seconds(1)),
            Self::MessageLockLost { .. } => Some(Duration::seconds(1)),
            Self::QuotaExceeded { .. } => Some(Duration::seconds(10)),
            Self::Timeout { .. } => Some(Duration::seconds(1)),
            _ => None,
        }
    }
}

/// Errors raised while parsing or evaluating SQL filters and rule actions
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FilterError {
    #[error("Syntax error at position {position}: {message}")]
    Syntax { position: usize, message: String },

    #[error("Evaluation failed: {message}")]
    Evaluation { message: String },

    #[error("Invalid rule: {message}")]
    InvalidRule { message: String },
}

/// Errors during message or topology serialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("YAML serialization failed: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("TOML parsing failed: {0}")]
    TomlParseError(#[from] toml::de::Error),

    #[error("TOML serialization failed: {0}")]
    TomlWriteError(#[from] toml::ser::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
