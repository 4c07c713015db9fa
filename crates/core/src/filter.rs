//! Compact filter mini-language used by queries and change subscriptions.
//!
//! A filter is written as `column=operator.value`, or
//! `column=in.(v1,v2,...)` for set membership. Supported operators are
//! `eq`, `neq`, `gt`, `gte`, `lt`, `lte`, and `in`.
//!
//! [`parse_filter`] is deliberately permissive: anything it cannot parse
//! becomes "no constraint" (`None`) instead of an error, because existing
//! callers pass user-assembled strings and rely on a result always being
//! produced. [`parse_strict`] is the opt-in rejecting variant.

use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use chrono::DateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;

/// `column=operator.rest` -- the value part is validated per operator.
static FILTER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^([A-Za-z_][A-Za-z0-9_]*)=([a-z]+)\.(.*)$").expect("valid regex")
});

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Comparison operator of a [`FilterExpression`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl FilterOperator {
    /// Parse the textual operator. Returns `None` for unknown operators.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "neq" => Some(Self::Neq),
            "gt" => Some(Self::Gt),
            "gte" => Some(Self::Gte),
            "lt" => Some(Self::Lt),
            "lte" => Some(Self::Lte),
            "in" => Some(Self::In),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::In => "in",
        }
    }
}

/// Right-hand side of a filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Single(String),
    Set(Vec<String>),
}

/// A single structured query constraint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FilterExpression {
    pub column: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

impl FilterExpression {
    /// Equality constraint, the most common case.
    pub fn eq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator: FilterOperator::Eq,
            value: FilterValue::Single(value.into()),
        }
    }

    pub fn neq(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator: FilterOperator::Neq,
            value: FilterValue::Single(value.into()),
        }
    }

    pub fn lt(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator: FilterOperator::Lt,
            value: FilterValue::Single(value.into()),
        }
    }

    /// Set-membership constraint.
    pub fn one_of<I, S>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            column: column.into(),
            operator: FilterOperator::In,
            value: FilterValue::Set(values.into_iter().map(Into::into).collect()),
        }
    }

    /// Evaluate the constraint against a JSON row.
    ///
    /// A row that is not an object, or lacks the column, never matches.
    /// Numbers (and numeric strings) compare numerically, RFC 3339
    /// timestamps chronologically, and everything else on its textual form.
    pub fn matches(&self, row: &Value) -> bool {
        let Some(field) = row.as_object().and_then(|obj| obj.get(&self.column)) else {
            return false;
        };

        match (&self.operator, &self.value) {
            (FilterOperator::In, FilterValue::Set(values)) => values
                .iter()
                .any(|v| compare(field, v) == Some(Ordering::Equal)),
            (FilterOperator::In, FilterValue::Single(v)) => {
                compare(field, v) == Some(Ordering::Equal)
            }
            (op, FilterValue::Single(v)) => {
                let Some(ord) = compare(field, v) else {
                    return false;
                };
                match op {
                    FilterOperator::Eq => ord == Ordering::Equal,
                    FilterOperator::Neq => ord != Ordering::Equal,
                    FilterOperator::Gt => ord == Ordering::Greater,
                    FilterOperator::Gte => ord != Ordering::Less,
                    FilterOperator::Lt => ord == Ordering::Less,
                    FilterOperator::Lte => ord != Ordering::Greater,
                    FilterOperator::In => ord == Ordering::Equal,
                }
            }
            // A set value only makes sense with `in`.
            (_, FilterValue::Set(_)) => false,
        }
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            FilterValue::Single(v) => write!(f, "{}={}.{}", self.column, self.operator.as_str(), v),
            FilterValue::Set(values) => write!(
                f,
                "{}={}.({})",
                self.column,
                self.operator.as_str(),
                values.join(",")
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a filter string, treating anything malformed as "no constraint".
///
/// Never panics and never errors.
pub fn parse_filter(input: &str) -> Option<FilterExpression> {
    parse_strict(input).ok()
}

/// Parse a filter string, rejecting malformed input and unknown operators.
pub fn parse_strict(input: &str) -> Result<FilterExpression, CoreError> {
    let caps = FILTER_RE.captures(input.trim()).ok_or_else(|| {
        CoreError::Validation(format!(
            "Filter '{input}' does not match 'column=operator.value'"
        ))
    })?;

    let column = caps[1].to_string();
    let operator = FilterOperator::parse(&caps[2]).ok_or_else(|| {
        CoreError::Validation(format!("Unknown filter operator '{}'", &caps[2]))
    })?;
    let raw = &caps[3];

    let value = if operator == FilterOperator::In {
        FilterValue::Set(parse_set(raw)?)
    } else {
        FilterValue::Single(raw.to_string())
    };

    Ok(FilterExpression {
        column,
        operator,
        value,
    })
}

/// Parse the `(v1,v2,...)` part of an `in` filter.
fn parse_set(raw: &str) -> Result<Vec<String>, CoreError> {
    let inner = raw
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| {
            CoreError::Validation(format!("'in' filter value must be parenthesised, got '{raw}'"))
        })?;

    let values: Vec<String> = inner
        .split(',')
        .map(|v| v.trim())
        .map(|v| {
            v.strip_prefix('"')
                .and_then(|s| s.strip_suffix('"'))
                .unwrap_or(v)
                .to_string()
        })
        .filter(|v| !v.is_empty())
        .collect();

    if values.is_empty() {
        return Err(CoreError::Validation(
            "'in' filter must list at least one value".to_string(),
        ));
    }
    Ok(values)
}

// ---------------------------------------------------------------------------
// Comparison helpers
// ---------------------------------------------------------------------------

/// Textual form of a JSON scalar as it appears in the filter language.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compare a row field with a filter operand. `None` when incomparable
/// (NaN on the numeric path).
fn compare(field: &Value, operand: &str) -> Option<Ordering> {
    let field_num = match field {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    };
    if let (Some(a), Ok(b)) = (field_num, operand.parse::<f64>()) {
        return a.partial_cmp(&b);
    }
    // Fractional seconds vary in width, so the text form does not sort.
    if let (Some(a), Ok(b)) = (
        field.as_str().and_then(|s| DateTime::parse_from_rfc3339(s).ok()),
        DateTime::parse_from_rfc3339(operand),
    ) {
        return Some(a.cmp(&b));
    }
    Some(as_text(field).as_str().cmp(operand))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
