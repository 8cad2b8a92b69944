//! Expression tree and evaluator for SQL filters and rule actions.
//!
//! Evaluation follows SQL three-valued logic: a missing property evaluates to
//! NULL, comparisons involving NULL are unknown, and unknown propagates
//! through `AND`/`OR`/`NOT` by the Kleene truth tables.

use super::EvaluationContext;
use crate::error::FilterError;
use crate::message::PropertyValue;
use regex::Regex;
use std::cmp::Ordering;

/// Broker-maintained message properties addressable as `sys.<Name>`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SystemProperty {
    MessageId,
    CorrelationId,
    SessionId,
    ContentType,
    Subject,
    To,
    ReplyTo,
    ReplyToSessionId,
    SequenceNumber,
    DeliveryCount,
    EnqueuedTimeUtc,
    Size,
}

impl SystemProperty {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        let property = match name.to_ascii_lowercase().as_str() {
            "messageid" => Self::MessageId,
            "correlationid" => Self::CorrelationId,
            "sessionid" => Self::SessionId,
            "contenttype" => Self::ContentType,
            "label" | "subject" => Self::Subject,
            "to" => Self::To,
            "replyto" => Self::ReplyTo,
            "replytosessionid" => Self::ReplyToSessionId,
            "sequencenumber" => Self::SequenceNumber,
            "deliverycount" => Self::DeliveryCount,
            "enqueuedtimeutc" => Self::EnqueuedTimeUtc,
            "size" => Self::Size,
            _ => return None,
        };
        Some(property)
    }

    /// Whether rule actions may assign or remove this property
    pub(crate) fn is_settable(&self) -> bool {
        matches!(
            self,
            Self::CorrelationId
                | Self::SessionId
                | Self::ContentType
                | Self::Subject
                | Self::To
                | Self::ReplyTo
                | Self::ReplyToSessionId
        )
    }

    fn read(&self, context: &EvaluationContext<'_>) -> PropertyValue {
        let message = context.message;
        let text = |value: Option<&str>| {
            value
                .map(|s| PropertyValue::String(s.to_string()))
                .unwrap_or(PropertyValue::Null)
        };

        match self {
            Self::MessageId => text(message.message_id.as_ref().map(|m| m.as_str())),
            Self::CorrelationId => text(message.correlation_id.as_deref()),
            Self::SessionId => text(message.session_id.as_ref().map(|s| s.as_str())),
            Self::ContentType => text(message.content_type.as_deref()),
            Self::Subject => text(message.subject.as_deref()),
            Self::To => text(message.to.as_deref()),
            Self::ReplyTo => text(message.reply_to.as_deref()),
            Self::ReplyToSessionId => text(message.reply_to_session_id.as_deref()),
            Self::SequenceNumber => context
                .sequence_number
                .map(PropertyValue::Int)
                .unwrap_or(PropertyValue::Null),
            Self::DeliveryCount => PropertyValue::Int(context.delivery_count as i64),
            Self::EnqueuedTimeUtc => context
                .enqueued_at
                .map(|t| PropertyValue::String(t.as_datetime().to_rfc3339()))
                .unwrap_or(PropertyValue::Null),
            Self::Size => PropertyValue::Int(message.size() as i64),
        }
    }
}

/// Reference to a property in an expression
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum PropertyRef {
    System(SystemProperty),
    User(String),
}

impl PropertyRef {
    fn read(&self, context: &EvaluationContext<'_>) -> Option<PropertyValue> {
        match self {
            Self::System(property) => match property.read(context) {
                PropertyValue::Null => None,
                value => Some(value),
            },
            Self::User(name) => context.message.application_properties.get(name).cloned(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Less,
    Greater,
    LessOrEqual,
    GreaterOrEqual,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(PropertyValue),
    Property(PropertyRef),
    Exists(PropertyRef),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    IsNull {
        operand: Box<Expr>,
        negated: bool,
    },
    Like {
        operand: Box<Expr>,
        pattern: Regex,
        negated: bool,
    },
    In {
        operand: Box<Expr>,
        values: Vec<PropertyValue>,
        negated: bool,
    },
}

impl Expr {
    pub(crate) fn evaluate(&self, context: &EvaluationContext<'_>) -> Result<PropertyValue, FilterError> {
        match self {
            Self::Literal(value) => Ok(value.clone()),
            Self::Property(property) => Ok(property.read(context).unwrap_or(PropertyValue::Null)),
            Self::Exists(property) => Ok(PropertyValue::Bool(property.read(context).is_some())),
            Self::Unary { op, operand } => {
                let value = operand.evaluate(context)?;
                match op {
                    UnaryOp::Not => Ok(tri_to_value(truth(&value)?.map(|b| !b))),
                    UnaryOp::Negate => match value {
                        PropertyValue::Null => Ok(PropertyValue::Null),
                        PropertyValue::Int(i) => i
                            .checked_neg()
                            .map(PropertyValue::Int)
                            .ok_or_else(|| overflow("negation")),
                        PropertyValue::Float(f) => Ok(PropertyValue::Float(-f)),
                        other => Err(FilterError::Evaluation {
                            message: format!("cannot negate a {}", other.type_name()),
                        }),
                    },
                }
            }
            Self::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = truth(&left.evaluate(context)?)?;
                    if l == Some(false) {
                        return Ok(PropertyValue::Bool(false));
                    }
                    let r = truth(&right.evaluate(context)?)?;
                    Ok(tri_to_value(match (l, r) {
                        (_, Some(false)) => Some(false),
                        (Some(true), Some(true)) => Some(true),
                        _ => None,
                    }))
                }
                BinaryOp::Or => {
                    let l = truth(&left.evaluate(context)?)?;
                    if l == Some(true) {
                        return Ok(PropertyValue::Bool(true));
                    }
                    let r = truth(&right.evaluate(context)?)?;
                    Ok(tri_to_value(match (l, r) {
                        (_, Some(true)) => Some(true),
                        (Some(false), Some(false)) => Some(false),
                        _ => None,
                    }))
                }
                BinaryOp::Equal
                | BinaryOp::NotEqual
                | BinaryOp::Less
                | BinaryOp::Greater
                | BinaryOp::LessOrEqual
                | BinaryOp::GreaterOrEqual => {
                    let l = left.evaluate(context)?;
                    let r = right.evaluate(context)?;
                    compare(*op, &l, &r)
                }
                BinaryOp::Add
                | BinaryOp::Subtract
                | BinaryOp::Multiply
                | BinaryOp::Divide
                | BinaryOp::Modulo => {
                    let l = left.evaluate(context)?;
                    let r = right.evaluate(context)?;
                    arithmetic(*op, l, r)
                }
            },
            Self::IsNull { operand, negated } => {
                let is_null = operand.evaluate(context)?.is_null();
                Ok(PropertyValue::Bool(is_null != *negated))
            }
            Self::Like {
                operand,
                pattern,
                negated,
            } => match operand.evaluate(context)? {
                PropertyValue::Null => Ok(PropertyValue::Null),
                PropertyValue::String(s) => Ok(PropertyValue::Bool(pattern.is_match(&s) != *negated)),
                other => Err(FilterError::Evaluation {
                    message: format!("LIKE requires a string, got {}", other.type_name()),
                }),
            },
            Self::In {
                operand,
                values,
                negated,
            } => {
                let value = operand.evaluate(context)?;
                if value.is_null() {
                    return Ok(PropertyValue::Null);
                }
                let mut found = false;
                for candidate in values {
                    if compare(BinaryOp::Equal, &value, candidate)? == PropertyValue::Bool(true) {
                        found = true;
                        break;
                    }
                }
                Ok(PropertyValue::Bool(found != *negated))
            }
        }
    }
}

/// Interpret a value as a SQL truth value (None = unknown)
fn truth(value: &PropertyValue) -> Result<Option<bool>, FilterError> {
    match value {
        PropertyValue::Bool(b) => Ok(Some(*b)),
        PropertyValue::Null => Ok(None),
        other => Err(FilterError::Evaluation {
            message: format!("expected a boolean, got {}", other.type_name()),
        }),
    }
}

fn tri_to_value(value: Option<bool>) -> PropertyValue {
    value.map(PropertyValue::Bool).unwrap_or(PropertyValue::Null)
}

fn overflow(operation: &str) -> FilterError {
    FilterError::Evaluation {
        message: format!("integer overflow in {}", operation),
    }
}

fn compare(op: BinaryOp, left: &PropertyValue, right: &PropertyValue) -> Result<PropertyValue, FilterError> {
    use PropertyValue as V;

    let ordering = match (left, right) {
        (V::Null, _) | (_, V::Null) => return Ok(V::Null),
        (V::Int(a), V::Int(b)) => a.cmp(b),
        (V::Int(a), V::Float(b)) => partial(&(*a as f64), b)?,
        (V::Float(a), V::Int(b)) => partial(a, &(*b as f64))?,
        (V::Float(a), V::Float(b)) => partial(a, b)?,
        (V::String(a), V::String(b)) => a.cmp(b),
        (V::Bool(a), V::Bool(b)) => {
            if !matches!(op, BinaryOp::Equal | BinaryOp::NotEqual) {
                return Err(FilterError::Evaluation {
                    message: "booleans only support = and <>".to_string(),
                });
            }
            a.cmp(b)
        }
        (l, r) => {
            return Err(FilterError::Evaluation {
                message: format!("cannot compare {} with {}", l.type_name(), r.type_name()),
            })
        }
    };

    let result = match op {
        BinaryOp::Equal => ordering == Ordering::Equal,
        BinaryOp::NotEqual => ordering != Ordering::Equal,
        BinaryOp::Less => ordering == Ordering::Less,
        BinaryOp::Greater => ordering == Ordering::Greater,
        BinaryOp::LessOrEqual => ordering != Ordering::Greater,
        BinaryOp::GreaterOrEqual => ordering != Ordering::Less,
        _ => unreachable!("compare called with non-comparison operator"),
    };
    Ok(V::Bool(result))
}

fn partial(a: &f64, b: &f64) -> Result<Ordering, FilterError> {
    a.partial_cmp(b).ok_or_else(|| FilterError::Evaluation {
        message: "cannot compare NaN".to_string(),
    })
}

fn arithmetic(op: BinaryOp, left: PropertyValue, right: PropertyValue) -> Result<PropertyValue, FilterError> {
    use PropertyValue as V;

    match (left, right) {
        (V::Null, _) | (_, V::Null) => Ok(V::Null),
        (V::Int(a), V::Int(b)) => {
            let result = match op {
                BinaryOp::Add => a.checked_add(b),
                BinaryOp::Subtract => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                BinaryOp::Divide | BinaryOp::Modulo if b == 0 => {
                    return Err(FilterError::Evaluation {
                        message: "division by zero".to_string(),
                    })
                }
                BinaryOp::Divide => a.checked_div(b),
                BinaryOp::Modulo => a.checked_rem(b),
                _ => unreachable!("arithmetic called with non-arithmetic operator"),
            };
            result.map(V::Int).ok_or_else(|| overflow("arithmetic"))
        }
        (V::String(a), V::String(b)) if op == BinaryOp::Add => Ok(V::String(a + &b)),
        (l, r) => {
            let (a, b) = match (numeric(&l), numeric(&r)) {
                (Some(a), Some(b)) => (a, b),
                _ => {
                    return Err(FilterError::Evaluation {
                        message: format!(
                            "arithmetic on {} and {} is not supported",
                            l.type_name(),
                            r.type_name()
                        ),
                    })
                }
            };
            let result = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Subtract => a - b,
                BinaryOp::Multiply => a * b,
                BinaryOp::Divide if b == 0.0 => {
                    return Err(FilterError::Evaluation {
                        message: "division by zero".to_string(),
                    })
                }
                BinaryOp::Divide => a / b,
                BinaryOp::Modulo => a % b,
                _ => unreachable!("arithmetic called with non-arithmetic operator"),
            };
            Ok(V::Float(result))
        }
    }
}

fn numeric(value: &PropertyValue) -> Option<f64> {
    match value {
        PropertyValue::Int(i) => Some(*i as f64),
        PropertyValue::Float(f) => Some(*f),
        _ => None,
    }
}

/// Translate a SQL `LIKE` pattern into an anchored regular expression
pub(crate) fn compile_like(pattern: &str, escape: Option<char>) -> Result<Regex, String> {
    let mut translated = String::from("(?s)^");
    let mut chars = pattern.chars();
    let mut buf = [0u8; 4];

    while let Some(c) = chars.next() {
        if Some(c) == escape {
            match chars.next() {
                Some(escaped) => translated.push_str(&regex::escape(escaped.encode_utf8(&mut buf))),
                None => return Err("escape character at end of LIKE pattern".to_string()),
            }
        } else if c == '%' {
            translated.push_str(".*");
        } else if c == '_' {
            translated.push('.');
        } else {
            translated.push_str(&regex::escape(c.encode_utf8(&mut buf)));
        }
    }

    translated.push('$');
    Regex::new(&translated).map_err(|e| e.to_string())
}
