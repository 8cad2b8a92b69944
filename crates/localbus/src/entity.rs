//! Entity descriptions: queue, topic, subscription and rule properties.
//!
//! These are the administration models. Each carries serde support so a whole
//! namespace can be described declaratively (see [`crate::topology`]).

use crate::config::NamespaceConfig;
use crate::error::ValidationError;
use crate::filter::{Filter, RuleAction};
use crate::message::EntityName;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Name of the rule every new subscription starts with
pub const DEFAULT_RULE_NAME: &str = "$Default";

/// Longest lock the broker grants on a message or session
pub const MAX_LOCK_DURATION_SECS: i64 = 300;

// ============================================================================
// Queue
// ============================================================================

/// Settings of a point-to-point queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueProperties {
    #[serde(with = "duration_secs")]
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    #[serde(with = "optional_duration_secs")]
    pub default_message_time_to_live: Option<Duration>,
    pub requires_session: bool,
    pub requires_duplicate_detection: bool,
    #[serde(with = "duration_secs")]
    pub duplicate_detection_history_time_window: Duration,
    pub dead_lettering_on_message_expiration: bool,
    pub max_size_in_messages: usize,
    pub forward_to: Option<EntityName>,
    pub forward_dead_lettered_messages_to: Option<EntityName>,
}

impl Default for QueueProperties {
    fn default() -> Self {
        Self {
            lock_duration: Duration::seconds(60),
            max_delivery_count: 10,
            default_message_time_to_live: None,
            requires_session: false,
            requires_duplicate_detection: false,
            duplicate_detection_history_time_window: Duration::minutes(10),
            dead_lettering_on_message_expiration: false,
            max_size_in_messages: 10_000,
            forward_to: None,
            forward_dead_lettered_messages_to: None,
        }
    }
}

impl QueueProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(mut self) -> Self {
        self.requires_session = true;
        self
    }

    pub fn with_duplicate_detection(mut self, window: Duration) -> Self {
        self.requires_duplicate_detection = true;
        self.duplicate_detection_history_time_window = window;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_message_time_to_live = Some(ttl);
        self
    }

    pub fn with_dead_lettering_on_expiration(mut self) -> Self {
        self.dead_lettering_on_message_expiration = true;
        self
    }

    pub fn with_max_size(mut self, max_messages: usize) -> Self {
        self.max_size_in_messages = max_messages;
        self
    }

    pub fn with_forward_to(mut self, target: EntityName) -> Self {
        self.forward_to = Some(target);
        self
    }

    pub fn with_forward_dead_lettered_to(mut self, target: EntityName) -> Self {
        self.forward_dead_lettered_messages_to = Some(target);
        self
    }

    /// Validate settings against namespace limits
    pub fn validate(&self, config: &NamespaceConfig) -> Result<(), ValidationError> {
        validate_lock_duration(self.lock_duration, config)?;
        validate_max_delivery_count(self.max_delivery_count)?;
        validate_ttl(self.default_message_time_to_live)?;
        validate_max_size(self.max_size_in_messages)?;
        if self.requires_duplicate_detection {
            validate_duplicate_window(self.duplicate_detection_history_time_window)?;
        }
        Ok(())
    }
}

// ============================================================================
// Topic
// ============================================================================

/// Settings of a publish/subscribe topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicProperties {
    #[serde(with = "optional_duration_secs")]
    pub default_message_time_to_live: Option<Duration>,
    pub requires_duplicate_detection: bool,
    #[serde(with = "duration_secs")]
    pub duplicate_detection_history_time_window: Duration,
    pub max_size_in_messages: usize,
}

impl Default for TopicProperties {
    fn default() -> Self {
        Self {
            default_message_time_to_live: None,
            requires_duplicate_detection: false,
            duplicate_detection_history_time_window: Duration::minutes(10),
            max_size_in_messages: 10_000,
        }
    }
}

impl TopicProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_duplicate_detection(mut self, window: Duration) -> Self {
        self.requires_duplicate_detection = true;
        self.duplicate_detection_history_time_window = window;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_message_time_to_live = Some(ttl);
        self
    }

    pub fn with_max_size(mut self, max_messages: usize) -> Self {
        self.max_size_in_messages = max_messages;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_ttl(self.default_message_time_to_live)?;
        validate_max_size(self.max_size_in_messages)?;
        if self.requires_duplicate_detection {
            validate_duplicate_window(self.duplicate_detection_history_time_window)?;
        }
        Ok(())
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Settings of a topic subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionProperties {
    #[serde(with = "duration_secs")]
    pub lock_duration: Duration,
    pub max_delivery_count: u32,
    #[serde(with = "optional_duration_secs")]
    pub default_message_time_to_live: Option<Duration>,
    pub requires_session: bool,
    pub dead_lettering_on_message_expiration: bool,
    pub dead_lettering_on_filter_evaluation_exceptions: bool,
    pub forward_to: Option<EntityName>,
    pub forward_dead_lettered_messages_to: Option<EntityName>,
}

impl Default for SubscriptionProperties {
    fn default() -> Self {
        Self {
            lock_duration: Duration::seconds(60),
            max_delivery_count: 10,
            default_message_time_to_live: None,
            requires_session: false,
            dead_lettering_on_message_expiration: false,
            dead_lettering_on_filter_evaluation_exceptions: true,
            forward_to: None,
            forward_dead_lettered_messages_to: None,
        }
    }
}

impl SubscriptionProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(mut self) -> Self {
        self.requires_session = true;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_max_delivery_count(mut self, count: u32) -> Self {
        self.max_delivery_count = count;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_message_time_to_live = Some(ttl);
        self
    }

    pub fn with_dead_lettering_on_expiration(mut self) -> Self {
        self.dead_lettering_on_message_expiration = true;
        self
    }

    pub fn with_forward_to(mut self, target: EntityName) -> Self {
        self.forward_to = Some(target);
        self
    }

    pub fn with_forward_dead_lettered_to(mut self, target: EntityName) -> Self {
        self.forward_dead_lettered_messages_to = Some(target);
        self
    }

    pub fn validate(&self, config: &NamespaceConfig) -> Result<(), ValidationError> {
        validate_lock_duration(self.lock_duration, config)?;
        validate_max_delivery_count(self.max_delivery_count)?;
        validate_ttl(self.default_message_time_to_live)
    }
}

// ============================================================================
// Rules
// ============================================================================

/// A named filter (and optional action) attached to a subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleProperties {
    pub name: String,
    pub filter: Filter,
    #[serde(default)]
    pub action: Option<RuleAction>,
}

impl RuleProperties {
    pub fn new(name: impl Into<String>, filter: Filter) -> Self {
        Self {
            name: name.into(),
            filter,
            action: None,
        }
    }

    /// The rule added to every new subscription: accept everything
    pub fn default_rule() -> Self {
        Self::new(DEFAULT_RULE_NAME, Filter::True)
    }

    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = Some(action);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() || self.name.len() > 50 {
            return Err(ValidationError::OutOfRange {
                field: "rule_name".to_string(),
                message: "must be 1-50 characters".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Runtime information
// ============================================================================

/// Message counts of a queue or subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRuntimeInfo {
    pub active_message_count: usize,
    pub locked_message_count: usize,
    pub scheduled_message_count: usize,
    pub deferred_message_count: usize,
    pub dead_letter_message_count: usize,
}

impl EntityRuntimeInfo {
    /// Everything held by the entity, dead-letter sub-queue included
    pub fn total_message_count(&self) -> usize {
        self.active_message_count
            + self.locked_message_count
            + self.scheduled_message_count
            + self.deferred_message_count
            + self.dead_letter_message_count
    }
}

/// Message counts of a topic, summed over its subscriptions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicRuntimeInfo {
    pub subscription_count: usize,
    pub scheduled_message_count: usize,
}

// ============================================================================
// Validation helpers
// ============================================================================

fn validate_lock_duration(lock: Duration, config: &NamespaceConfig) -> Result<(), ValidationError> {
    if lock < config.min_lock_duration || lock > Duration::seconds(MAX_LOCK_DURATION_SECS) {
        return Err(ValidationError::OutOfRange {
            field: "lock_duration".to_string(),
            message: format!(
                "must be between {}ms and {}s",
                config.min_lock_duration.num_milliseconds(),
                MAX_LOCK_DURATION_SECS
            ),
        });
    }
    Ok(())
}

fn validate_max_delivery_count(count: u32) -> Result<(), ValidationError> {
    if count == 0 {
        return Err(ValidationError::OutOfRange {
            field: "max_delivery_count".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn validate_ttl(ttl: Option<Duration>) -> Result<(), ValidationError> {
    if let Some(ttl) = ttl {
        if ttl <= Duration::zero() {
            return Err(ValidationError::OutOfRange {
                field: "default_message_time_to_live".to_string(),
                message: "must be positive".to_string(),
            });
        }
    }
    Ok(())
}

fn validate_max_size(max: usize) -> Result<(), ValidationError> {
    if max == 0 {
        return Err(ValidationError::OutOfRange {
            field: "max_size_in_messages".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn validate_duplicate_window(window: Duration) -> Result<(), ValidationError> {
    if window <= Duration::zero() || window > Duration::days(7) {
        return Err(ValidationError::OutOfRange {
            field: "duplicate_detection_history_time_window".to_string(),
            message: "must be positive and at most 7 days".to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// Duration serialization (fractional seconds)
// ============================================================================

/// Serialize a `chrono::Duration` as fractional seconds
pub(crate) mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.num_milliseconds() as f64 / 1000.0)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number"));
        }
        Ok(Duration::milliseconds((secs * 1000.0).round() as i64))
    }
}

/// Serialize an optional `chrono::Duration` as fractional seconds
pub(crate) mod optional_duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.num_milliseconds() as f64 / 1000.0)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(s) if !s.is_finite() || s < 0.0 => Err(serde::de::Error::custom(
                "duration must be a non-negative number",
            )),
            Some(s) => Ok(Some(Duration::milliseconds((s * 1000.0).round() as i64))),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[path = "entity_tests.rs"]
mod tests;
