//! Attribute values, rows and per-column casts.
//!
//! Values are `serde_json::Value`s so the same representation serves relational
//! rows and documents. Rows keep insertion order (`preserve_order`).

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use std::cmp::Ordering;

pub use serde_json::Value;

/// An ordered mapping of column (or field) name to value
pub type Row = serde_json::Map<String, Value>;

/// Storage format used for generated timestamps and `datetime` casts
pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Per-column type cast applied on hydration and before writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cast {
    Int,
    Float,
    Bool,
    String,
    Json,
    DateTime,
}

impl Cast {
    /// Convert a value read from storage into its in-memory form
    pub fn from_storage(self, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        match self {
            Cast::Int => to_int(&value).map(Value::from).unwrap_or(value),
            Cast::Float => to_float(&value)
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .unwrap_or(value),
            Cast::Bool => Value::Bool(truthy(&value)),
            Cast::String => Value::String(to_text(&value)),
            Cast::Json => match &value {
                Value::String(s) => serde_json::from_str(s).unwrap_or(value),
                _ => value,
            },
            Cast::DateTime => match &value {
                Value::String(s) => normalize_datetime(s, DEFAULT_TIMESTAMP_FORMAT)
                    .map(Value::String)
                    .unwrap_or(value),
                _ => value,
            },
        }
    }

    /// Convert an in-memory value into the form written to storage
    pub fn for_storage(self, value: Value) -> Value {
        if value.is_null() {
            return value;
        }
        match self {
            Cast::Int => to_int(&value).map(Value::from).unwrap_or(value),
            Cast::Float => to_float(&value)
                .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                .unwrap_or(value),
            // 0/1 keeps booleans portable across backends
            Cast::Bool => Value::from(i64::from(truthy(&value))),
            Cast::String => Value::String(to_text(&value)),
            Cast::Json => match value {
                Value::String(_) => value,
                other => Value::String(other.to_string()),
            },
            Cast::DateTime => match &value {
                Value::String(s) => normalize_datetime(s, DEFAULT_TIMESTAMP_FORMAT)
                    .map(Value::String)
                    .unwrap_or(value),
                _ => value,
            },
        }
    }
}

fn to_int(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::Bool(b) => Some(i64::from(*b)),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| s.trim().parse::<f64>().ok().map(|f| f as i64)),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse the common datetime spellings and re-render them in UTC with `format`
pub fn normalize_datetime(input: &str, format: &str) -> Option<String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc).format(format).to_string());
    }
    for pattern in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(input, pattern) {
            return Some(dt.format(format).to_string());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.format(format).to_string())
}

/// Current UTC time rendered with `format`
pub fn now_string(format: &str) -> String {
    Utc::now().format(format).to_string()
}

/// String key for a primary-key value.
///
/// Used by the identity map and by relation grouping so that `7` and `"7"`
/// (a relational id and its document-store spelling) address the same entity.
pub fn id_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && n.as_i64().is_none() && n.as_u64().is_none() => {
                format!("{}", f as i64)
            }
            _ => n.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Equality used by predicates: numbers compare numerically, everything else structurally
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// Total order over values for sorting: null < bool < number < string < other
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)).then_with(|| a.to_string().cmp(&b.to_string())),
    }
}
