//! Correlation filters: equality matching on headers and application properties.

use crate::error::FilterError;
use crate::message::{Message, PropertyValue};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Matches when every configured field equals the message's value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationFilter {
    pub correlation_id: Option<String>,
    pub message_id: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub subject: Option<String>,
    pub session_id: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub content_type: Option<String>,
    pub properties: HashMap<String, PropertyValue>,
}

impl CorrelationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
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

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_reply_to_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.reply_to_session_id = Some(session_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    fn is_empty(&self) -> bool {
        self.correlation_id.is_none()
            && self.message_id.is_none()
            && self.to.is_none()
            && self.reply_to.is_none()
            && self.subject.is_none()
            && self.session_id.is_none()
            && self.reply_to_session_id.is_none()
            && self.content_type.is_none()
            && self.properties.is_empty()
    }

    /// A correlation filter needs at least one condition
    pub fn validate(&self) -> Result<(), FilterError> {
        if self.is_empty() {
            return Err(FilterError::InvalidRule {
                message: "correlation filter must set at least one property".to_string(),
            });
        }
        Ok(())
    }

    pub fn matches(&self, message: &Message) -> bool {
        fn field(expected: &Option<String>, actual: Option<&str>) -> bool {
            match expected {
                Some(expected) => actual == Some(expected.as_str()),
                None => true,
            }
        }

        field(&self.correlation_id, message.correlation_id.as_deref())
            && field(
                &self.message_id,
                message.message_id.as_ref().map(|m| m.as_str()),
            )
            && field(&self.to, message.to.as_deref())
            && field(&self.reply_to, message.reply_to.as_deref())
            && field(&self.subject, message.subject.as_deref())
            && field(
                &self.session_id,
                message.session_id.as_ref().map(|s| s.as_str()),
            )
            && field(
                &self.reply_to_session_id,
                message.reply_to_session_id.as_deref(),
            )
            && field(&self.content_type, message.content_type.as_deref())
            && self
                .properties
                .iter()
                .all(|(key, expected)| message.application_properties.get(key) == Some(expected))
    }
}

#[cfg(test)]
#[path = "correlation_tests.rs"]
mod tests;
