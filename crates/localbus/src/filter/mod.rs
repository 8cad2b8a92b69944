//! Subscription rule filters and actions.
//!
//! A subscription holds one or more rules. Each rule has a [`Filter`] deciding
//! whether a message published to the topic is copied into the subscription,
//! and an optional [`RuleAction`] that modifies the copy.
//!
//! - [`Filter::True`] / [`Filter::False`] accept or reject everything
//! - [`CorrelationFilter`] matches header and property values by equality
//! - [`SqlFilter`] evaluates a SQL-92 style boolean expression
//!
//! ```rust
//! use localbus::filter::Filter;
//!
//! let filter = Filter::sql("priority > 3 AND sys.Label = 'order'").unwrap();
//! assert!(matches!(filter, Filter::Sql { .. }));
//! ```

pub mod action;
pub mod correlation;
mod expr;
mod sql;

pub use action::RuleAction;
pub use correlation::CorrelationFilter;

use crate::error::FilterError;
use crate::message::{Message, PropertyValue, Timestamp};
use expr::Expr;
use serde::{Deserialize, Serialize};


// ============================================================================
// Evaluation context
// ============================================================================

/// A message as seen by filters: headers and properties plus broker metadata
#[derive(Debug, Clone, Copy)]
pub struct EvaluationContext<'a> {
    pub message: &'a Message,
    pub sequence_number: Option<i64>,
    pub enqueued_at: Option<Timestamp>,
    pub delivery_count: u32,
}

impl<'a> EvaluationContext<'a> {
    /// Context for a message that has not been assigned broker metadata
    pub fn for_message(message: &'a Message) -> Self {
        Self {
            message,
            sequence_number: None,
            enqueued_at: None,
            delivery_count: 0,
        }
    }

    /// Context with the sequence number and enqueue time the broker assigned
    pub fn for_enqueued(message: &'a Message, sequence_number: i64, enqueued_at: Timestamp) -> Self {
        Self {
            message,
            sequence_number: Some(sequence_number),
            enqueued_at: Some(enqueued_at),
            delivery_count: 0,
        }
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Filter deciding whether a rule matches a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Filter {
    True,
    False,
    Sql { expression: SqlFilter },
    Correlation(CorrelationFilter),
}

impl Filter {
    /// Parse a SQL filter expression
    pub fn sql(expression: &str) -> Result<Self, FilterError> {
        Ok(Self::Sql {
            expression: SqlFilter::new(expression)?,
        })
    }

    /// Wrap a correlation filter, rejecting one with no conditions
    pub fn correlation(filter: CorrelationFilter) -> Result<Self, FilterError> {
        filter.validate()?;
        Ok(Self::Correlation(filter))
    }

    /// Evaluate the filter. `Ok(false)` means no match; `Err` is an evaluation fault.
    pub fn matches(&self, context: &EvaluationContext<'_>) -> Result<bool, FilterError> {
        match self {
            Self::True => Ok(true),
            Self::False => Ok(false),
            Self::Sql { expression } => expression.matches(context),
            Self::Correlation(filter) => Ok(filter.matches(context.message)),
        }
    }
}

// ============================================================================
// SqlFilter
// ============================================================================

/// A parsed SQL filter expression
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SqlFilter {
    expression: String,
    ast: Expr,
}

impl SqlFilter {
    /// Parse a filter expression such as `color = 'blue' AND quantity >= 10`
    pub fn new(expression: &str) -> Result<Self, FilterError> {
        let ast = sql::parse_filter(expression)?;
        Ok(Self {
            expression: expression.to_string(),
            ast,
        })
    }

    /// Source text of the expression
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// True only when the expression evaluates to TRUE (unknown counts as no match)
    pub fn matches(&self, context: &EvaluationContext<'_>) -> Result<bool, FilterError> {
        match self.ast.evaluate(context)? {
            PropertyValue::Bool(b) => Ok(b),
            PropertyValue::Null => Ok(false),
            other => Err(FilterError::Evaluation {
                message: format!(
                    "filter must evaluate to a boolean, got {}",
                    other.type_name()
                ),
            }),
        }
    }
}

impl PartialEq for SqlFilter {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl TryFrom<String> for SqlFilter {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<SqlFilter> for String {
    fn from(value: SqlFilter) -> Self {
        value.expression
    }
}

impl std::fmt::Display for SqlFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.expression)
    }
}
