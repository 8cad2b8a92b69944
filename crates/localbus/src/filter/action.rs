//! SQL rule actions (`SET` / `REMOVE`) applied to matched subscription copies.

use super::expr::{PropertyRef, SystemProperty};
use super::sql::{self, Statement};
use super::EvaluationContext;
use crate::error::FilterError;
use crate::message::{Message, PropertyValue, SessionId};
use serde::{Deserialize, Serialize};

/// A parsed rule action such as `SET priority = priority + 1; REMOVE draft`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuleAction {
    expression: String,
    statements: Vec<Statement>,
}

impl RuleAction {
    pub fn new(expression: &str) -> Result<Self, FilterError> {
        let statements = sql::parse_actions(expression)?;
        Ok(Self {
            expression: expression.to_string(),
            statements,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Apply every statement in order; later statements see earlier changes
    pub fn apply(
        &self,
        message: &mut Message,
        sequence_number: Option<i64>,
    ) -> Result<(), FilterError> {
        for statement in &self.statements {
            match statement {
                Statement::Set { target, value } => {
                    let value = {
                        let context = EvaluationContext {
                            message,
                            sequence_number,
                            enqueued_at: None,
                            delivery_count: 0,
                        };
                        value.evaluate(&context)?
                    };
                    assign(message, target, Some(value))?;
                }
                Statement::Remove { target } => assign(message, target, None)?,
            }
        }
        Ok(())
    }
}

fn assign(
    message: &mut Message,
    target: &PropertyRef,
    value: Option<PropertyValue>,
) -> Result<(), FilterError> {
    let property = match target {
        PropertyRef::User(name) => {
            match value {
                Some(value) => {
                    message.application_properties.insert(name.clone(), value);
                }
                None => {
                    message.application_properties.remove(name);
                }
            }
            return Ok(());
        }
        PropertyRef::System(property) => *property,
    };

    let text = match value {
        None | Some(PropertyValue::Null) => None,
        Some(PropertyValue::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };

    match property {
        SystemProperty::CorrelationId => message.correlation_id = text,
        SystemProperty::ContentType => message.content_type = text,
        SystemProperty::Subject => message.subject = text,
        SystemProperty::To => message.to = text,
        SystemProperty::ReplyTo => message.reply_to = text,
        SystemProperty::ReplyToSessionId => message.reply_to_session_id = text,
        SystemProperty::SessionId => {
            message.session_id = text
                .map(SessionId::new)
                .transpose()
                .map_err(|e| FilterError::Evaluation {
                    message: e.to_string(),
                })?
        }
        other => {
            return Err(FilterError::Evaluation {
                message: format!("system property {:?} is read-only", other),
            })
        }
    }
    Ok(())
}

impl PartialEq for RuleAction {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl TryFrom<String> for RuleAction {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<RuleAction> for String {
    fn from(value: RuleAction) -> Self {
        value.expression
    }
}

#[cfg(test)]
#[path = "action_tests.rs"]
mod tests;
