//! Type-aware comparison shared by assertions, condition branches and
//! condition loops.

use crate::error::StepError;
use crate::placeholder::display_value;
use serde::Serialize;
use serde_json::{Number, Value};
use std::cmp::Ordering;
use std::fmt;

/// Closed set of comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    LenEq,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    NotEmpty,
    Empty,
}

impl Operator {
    pub fn parse(raw: &str) -> Result<Self, StepError> {
        let op = match raw.trim() {
            "等于" | "eq" | "==" => Self::Eq,
            "不等于" | "ne" | "!=" => Self::Ne,
            "大于" | "gt" | ">" => Self::Gt,
            "大于等于" | "ge" | ">=" => Self::Ge,
            "小于" | "lt" | "<" => Self::Lt,
            "小于等于" | "le" | "<=" => Self::Le,
            "长度等于" | "len_eq" => Self::LenEq,
            "包含" | "contains" => Self::Contains,
            "不包含" | "not_contains" => Self::NotContains,
            "以...开始" | "starts_with" => Self::StartsWith,
            "以...结束" | "ends_with" => Self::EndsWith,
            "非空" | "not_empty" => Self::NotEmpty,
            "为空" | "empty" => Self::Empty,
            other => {
                return Err(StepError::config(format!(
                    "unsupported comparison operator '{other}'"
                )))
            }
        };
        Ok(op)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Ge => "ge",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::LenEq => "len_eq",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::StartsWith => "starts_with",
            Self::EndsWith => "ends_with",
            Self::NotEmpty => "not_empty",
            Self::Empty => "empty",
        };
        f.write_str(s)
    }
}

/// Coerce numeric and boolean strings into their typed form.
///
/// `"42"` and `"-7"` become integers, a string containing `.` that parses
/// as a float becomes a float, and `"true"`/`"false"` (any case) become
/// booleans. Everything else is returned unchanged.
pub fn normalize(value: &Value) -> Value {
    let Value::String(s) = value else {
        return value.clone();
    };
    let digits = s.strip_prefix('-').unwrap_or(s);
    if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(i) = s.parse::<i64>() {
            return Value::Number(i.into());
        }
    }
    if s.contains('.') {
        if let Some(n) = s.parse::<f64>().ok().and_then(Number::from_f64) {
            return Value::Number(n);
        }
    }
    if s.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if s.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    value.clone()
}

fn same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Equality: exact first, then after normalising both sides.
pub fn loose_eq(actual: &Value, expected: &Value) -> bool {
    same(actual, expected) || same(&normalize(actual), &normalize(expected))
}

/// Ordering: numeric when both sides normalise to numbers, otherwise the
/// text forms are compared.
pub fn loose_cmp(actual: &Value, expected: &Value) -> Ordering {
    let a = normalize(actual);
    let b = normalize(expected);
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        if let Some(ord) = x.partial_cmp(&y) {
            return ord;
        }
    }
    display_value(actual).cmp(&display_value(expected))
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

fn length_of(value: &Value) -> usize {
    match value {
        Value::Array(items) => items.len(),
        Value::Object(map) => map.len(),
        other => display_value(other).chars().count(),
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        Value::Object(map) => map.contains_key(&display_value(expected)),
        other => display_value(other).contains(&display_value(expected)),
    }
}

/// Evaluate `actual <op> expected`.
pub fn compare(actual: &Value, op: Operator, expected: &Value) -> Result<bool, StepError> {
    let outcome = match op {
        Operator::Eq => loose_eq(actual, expected),
        Operator::Ne => !loose_eq(actual, expected),
        Operator::Gt => loose_cmp(actual, expected) == Ordering::Greater,
        Operator::Ge => loose_cmp(actual, expected) != Ordering::Less,
        Operator::Lt => loose_cmp(actual, expected) == Ordering::Less,
        Operator::Le => loose_cmp(actual, expected) != Ordering::Greater,
        Operator::LenEq => {
            let wanted = normalize(expected);
            let Some(wanted) = wanted.as_u64() else {
                return Err(StepError::config(format!(
                    "len_eq expects a non-negative integer, got {expected}"
                )));
            };
            length_of(actual) as u64 == wanted
        }
        Operator::Contains => contains(actual, expected),
        Operator::NotContains => !contains(actual, expected),
        Operator::StartsWith => display_value(actual).starts_with(&display_value(expected)),
        Operator::EndsWith => display_value(actual).ends_with(&display_value(expected)),
        Operator::NotEmpty => !is_empty(actual),
        Operator::Empty => is_empty(actual),
    };
    Ok(outcome)
}

/// Parse `operation` and evaluate it in one go.
pub fn compare_str(actual: &Value, operation: &str, expected: &Value) -> Result<bool, StepError> {
    compare(actual, Operator::parse(operation)?, expected)
}
