//! Runtime attribute queries.
//!
//! A task descriptor may restrict where it runs with a small boolean query over runtime
//! attributes. Besides the free-form `attributes` map, the pseudo-attributes `id`,
//! `exclusivity` and `task_count` are always available.

use super::runtime::RuntimeInfo;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RuntimeQuery {
    /// Matches every runtime.
    Any,
    Exists { attribute: String },
    Eq { attribute: String, value: Value },
    Ne { attribute: String, value: Value },
    Gt { attribute: String, value: f64 },
    Lt { attribute: String, value: f64 },
    /// Substring of a string attribute, or element of an array attribute.
    Contains { attribute: String, value: String },
    /// Regular expression over a string attribute.
    Matches { attribute: String, pattern: String },
    And { queries: Vec<RuntimeQuery> },
    Or { queries: Vec<RuntimeQuery> },
    Not { query: Box<RuntimeQuery> },
}

impl RuntimeQuery {
    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn gt(attribute: impl Into<String>, value: f64) -> Self {
        Self::Gt {
            attribute: attribute.into(),
            value,
        }
    }

    pub fn matches_pattern(attribute: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::Matches {
            attribute: attribute.into(),
            pattern: pattern.into(),
        }
    }

    pub fn and(queries: Vec<RuntimeQuery>) -> Self {
        Self::And { queries }
    }

    pub fn or(queries: Vec<RuntimeQuery>) -> Self {
        Self::Or { queries }
    }

    pub fn negate(query: RuntimeQuery) -> Self {
        Self::Not {
            query: Box::new(query),
        }
    }

    /// Checks that every regular expression in the query compiles.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Matches { pattern, .. } => Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| format!("invalid pattern '{pattern}': {e}")),
            Self::And { queries } | Self::Or { queries } => {
                queries.iter().try_for_each(|query| query.validate())
            }
            Self::Not { query } => query.validate(),
            _ => Ok(()),
        }
    }

    pub fn matches(&self, runtime: &RuntimeInfo) -> bool {
        match self {
            Self::Any => true,
            Self::Exists { attribute } => attribute_of(runtime, attribute).is_some(),
            Self::Eq { attribute, value } => {
                attribute_of(runtime, attribute).is_some_and(|actual| loosely_equal(&actual, value))
            }
            Self::Ne { attribute, value } => {
                attribute_of(runtime, attribute).is_none_or(|actual| !loosely_equal(&actual, value))
            }
            Self::Gt { attribute, value } => {
                number_of(runtime, attribute).is_some_and(|actual| actual > *value)
            }
            Self::Lt { attribute, value } => {
                number_of(runtime, attribute).is_some_and(|actual| actual < *value)
            }
            Self::Contains { attribute, value } => match attribute_of(runtime, attribute) {
                Some(Value::String(text)) => text.contains(value.as_str()),
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| item.as_str() == Some(value.as_str())),
                _ => false,
            },
            Self::Matches { attribute, pattern } => {
                let Ok(regex) = Regex::new(pattern) else {
                    return false;
                };
                match attribute_of(runtime, attribute) {
                    Some(Value::String(text)) => regex.is_match(&text),
                    _ => false,
                }
            }
            Self::And { queries } => queries.iter().all(|query| query.matches(runtime)),
            Self::Or { queries } => queries.iter().any(|query| query.matches(runtime)),
            Self::Not { query } => !query.matches(runtime),
        }
    }
}

fn attribute_of(runtime: &RuntimeInfo, attribute: &str) -> Option<Value> {
    match attribute {
        "id" => Some(Value::String(runtime.id.clone())),
        "exclusivity" => Some(Value::String(runtime.exclusivity.to_string())),
        "task_count" => Some(Value::from(runtime.task_count)),
        other => runtime.attributes.get(other).cloned(),
    }
}

fn number_of(runtime: &RuntimeInfo, attribute: &str) -> Option<f64> {
    match attribute_of(runtime, attribute)? {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.parse().ok(),
        _ => None,
    }
}

/// Numbers compare by value and strings compare case-insensitively.
fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::String(a), Value::String(b)) => a.eq_ignore_ascii_case(b),
        (a, b) => a == b,
    }
}
