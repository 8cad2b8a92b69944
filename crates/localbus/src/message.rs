//! Message types for broker operations including core domain identifiers.

use crate::error::ValidationError;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

// ============================================================================
// Dead-letter reasons assigned by the broker
// ============================================================================

/// Delivery count reached the entity's `max_delivery_count`
pub const DEAD_LETTER_MAX_DELIVERY_COUNT: &str = "MaxDeliveryCountExceeded";

/// Time-to-live elapsed on an entity that dead-letters expired messages
pub const DEAD_LETTER_TTL_EXPIRED: &str = "TTLExpiredException";

/// A subscription rule failed to evaluate against the message
pub const DEAD_LETTER_FILTER_EVALUATION: &str = "FilterEvaluationException";

/// Auto-forwarding chain exceeded the hop limit
pub const DEAD_LETTER_MAX_TRANSFER_HOPS: &str = "MaxTransferHopCountExceeded";

/// A message without a session id reached a session-enabled subscription
pub const DEAD_LETTER_SESSION_ID_MISSING: &str = "SessionIdIsMissing";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Validated entity path (queue, topic or subscription name)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityName(String);

impl EntityName {
    /// Create new entity name with validation
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();

        if name.is_empty() || name.len() > 260 {
            return Err(ValidationError::OutOfRange {
                field: "entity_name".to_string(),
                message: "must be 1-260 characters".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message: "only ASCII letters, digits, '.', '-', '_' and '/' allowed".to_string(),
            });
        }

        let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric());
        let ends_ok = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
        if !starts_ok || !ends_ok || name.contains("//") {
            return Err(ValidationError::InvalidFormat {
                field: "entity_name".to_string(),
                message: "must start and end with a letter or digit and contain no '//'"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    /// Get entity name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntityName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EntityName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EntityName {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EntityName> for String {
    fn from(value: EntityName) -> Self {
        value.0
    }
}

/// Application-defined message identifier, used for duplicate detection
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.simple().to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        if s.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "message_id".to_string(),
                message: "maximum 128 characters".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Identifier for grouping related messages for ordered processing
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create new session ID with validation
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::Required {
                field: "session_id".to_string(),
            });
        }

        if id.len() > 128 {
            return Err(ValidationError::OutOfRange {
                field: "session_id".to_string(),
                message: "maximum 128 characters".to_string(),
            });
        }

        if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(ValidationError::InvalidFormat {
                field: "session_id".to_string(),
                message: "only ASCII printable characters allowed".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Get session ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Token identifying one peek-lock delivery of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(uuid::Uuid);

impl LockToken {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl std::fmt::Display for LockToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Timestamp shifted by `duration`, saturating at the representable maximum
    pub fn after(&self, duration: Duration) -> Self {
        Self(
            self.0
                .checked_add_signed(duration)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    /// Time left until this timestamp, zero when already passed
    pub fn remaining(&self) -> Duration {
        let now = Utc::now();
        if now >= self.0 {
            Duration::zero()
        } else {
            self.0 - now
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S%.3f UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Application properties
// ============================================================================

/// Typed value of an application property or filter expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Name of the value's type, used in evaluation errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Approximate encoded size in bytes
    pub(crate) fn encoded_len(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::Float(_) => 8,
            Self::String(s) => s.len(),
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(v) => write!(f, "{}", v),
            Self::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        Self::Int(value as i64)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message to be sent to a queue or topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "bytes_serde")]
    pub body: Bytes,
    pub message_id: Option<MessageId>,
    pub session_id: Option<SessionId>,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub subject: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    #[serde(with = "crate::entity::optional_duration_secs", default)]
    pub time_to_live: Option<Duration>,
    pub scheduled_enqueue_time: Option<Timestamp>,
    pub application_properties: HashMap<String, PropertyValue>,
}

/// Custom serialization for Bytes
mod bytes_serde {
    use base64::{engine::general_purpose, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = general_purpose::STANDARD.encode(bytes);
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        let decoded = general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)?;
        Ok(Bytes::from(decoded))
    }
}

impl Message {
    /// Create new message with body
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            message_id: None,
            session_id: None,
            correlation_id: None,
            content_type: None,
            subject: None,
            to: None,
            reply_to: None,
            reply_to_session_id: None,
            time_to_live: None,
            scheduled_enqueue_time: None,
            application_properties: HashMap::new(),
        }
    }

    /// Create a JSON message from a serializable value
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self, crate::error::SerializationError> {
        let body = serde_json::to_vec(value)?;
        Ok(Self::new(body).with_content_type("application/json"))
    }

    /// Set the application message id (used for duplicate detection)
    pub fn with_message_id(mut self, message_id: MessageId) -> Self {
        self.message_id = Some(message_id);
        self
    }

    /// Add session ID for ordered processing
    pub fn with_session_id(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    /// Add correlation ID for tracking
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the subject (label) used by filters for routing
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_reply_to_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.reply_to_session_id = Some(session_id.into());
        self
    }

    /// Add time-to-live for message expiration
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    /// Add an application property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.application_properties.insert(key.into(), value.into());
        self
    }

    /// Body as UTF-8 text
    pub fn body_as_str(&self) -> Result<&str, crate::error::SerializationError> {
        std::str::from_utf8(&self.body).map_err(|_| crate::error::SerializationError::InvalidUtf8)
    }

    /// Deserialize a JSON body
    pub fn body_as_json<T: serde::de::DeserializeOwned>(
        &self,
    ) -> Result<T, crate::error::SerializationError> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Approximate wire size: body, header strings and application properties
    pub fn size(&self) -> usize {
        let headers = [
            self.message_id.as_ref().map(|m| m.as_str().len()),
            self.session_id.as_ref().map(|s| s.as_str().len()),
            self.correlation_id.as_ref().map(String::len),
            self.content_type.as_ref().map(String::len),
            self.subject.as_ref().map(String::len),
            self.to.as_ref().map(String::len),
            self.reply_to.as_ref().map(String::len),
            self.reply_to_session_id.as_ref().map(String::len),
        ]
        .into_iter()
        .flatten()
        .sum::<usize>();

        let properties = self
            .application_properties
            .iter()
            .map(|(k, v)| k.len() + v.encoded_len())
            .sum::<usize>();

        self.body.len() + headers + properties
    }
}

/// Where a received message currently lives within its entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageState {
    Active,
    Deferred,
    Scheduled,
}

/// A message received from an entity with broker-assigned metadata
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message_id: MessageId,
    pub message: Message,
    pub sequence_number: i64,
    pub enqueued_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub delivery_count: u32,
    pub lock_token: Option<LockToken>,
    pub locked_until: Option<Timestamp>,
    pub state: MessageState,
    pub dead_letter_reason: Option<String>,
    pub dead_letter_error_description: Option<String>,
    pub dead_letter_source: Option<String>,
}

impl ReceivedMessage {
    pub fn body(&self) -> &Bytes {
        &self.message.body
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.message.session_id.as_ref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.correlation_id.as_deref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.message.subject.as_deref()
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.message.application_properties.get(key)
    }

    /// Convert back to Message (for forwarding/replaying)
    pub fn to_message(&self) -> Message {
        let mut message = self.message.clone();
        message.message_id = Some(self.message_id.clone());
        message.scheduled_enqueue_time = None;
        message
    }

    /// Lock token, failing when the message was received without a lock
    pub fn require_lock_token(&self) -> Result<LockToken, crate::error::BusError> {
        self.lock_token
            .ok_or_else(|| crate::error::BusError::InvalidOperation {
                message: format!(
                    "message {} was not received in peek-lock mode",
                    self.sequence_number
                ),
            })
    }
}

// ============================================================================
// Receive Options
// ============================================================================

/// How the broker settles messages on delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReceiveMode {
    /// Lock on delivery; the receiver must settle explicitly
    #[default]
    PeekLock,
    /// Remove on delivery (at-most-once)
    ReceiveAndDelete,
}

/// Sub-queue of an entity a receiver reads from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SubQueue {
    #[default]
    None,
    DeadLetter,
}

/// Configuration options for receivers
#[derive(Debug, Clone, Default)]
pub struct ReceiverOptions {
    pub receive_mode: ReceiveMode,
    pub sub_queue: SubQueue,
    /// Extra messages fetched ahead of each receive and buffered locally.
    /// Their locks run while they sit in the buffer.
    pub prefetch_count: usize,
}

impl ReceiverOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn receive_and_delete(mut self) -> Self {
        self.receive_mode = ReceiveMode::ReceiveAndDelete;
        self
    }

    /// Read from the dead-letter sub-queue
    pub fn dead_letter(mut self) -> Self {
        self.sub_queue = SubQueue::DeadLetter;
        self
    }

    pub fn with_prefetch(mut self, count: usize) -> Self {
        self.prefetch_count = count;
        self
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
