/// Lenient accessors over raw host JSON.
///
/// Host objects are loosely typed: counters may arrive as strings, flags as
/// `1`/`"true"`, and serialized rolls as JSON strings. These helpers never fail;
/// anything unusable reads as absent.
use serde_json::Value;
use std::borrow::Cow;

/// Shared `null` for lookups on absent objects.
pub static NULL: Value = Value::Null;

/// Follows a chain of object keys, returning `None` as soon as a step is missing.
pub fn path<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().try_fold(value, |current, key| current.get(*key))
}

/// Reads a non-empty string, or a number rendered as text.
pub fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Shorthand for `path` followed by `text`.
pub fn text_at(value: &Value, keys: &[&str]) -> Option<String> {
    path(value, keys).and_then(text)
}

/// JavaScript-style truthiness.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Reads a finite number from a number or numeric string.
pub fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Reads a whole number (integral floats are accepted).
pub fn integer(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    number(value)
        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
        .map(|f| f as i64)
}

/// Coerces a counter: negatives, garbage and missing values become zero.
pub fn count(value: Option<&Value>) -> u64 {
    value
        .and_then(number)
        .filter(|f| *f > 0.0)
        .map(|f| f.floor() as u64)
        .unwrap_or(0)
}

/// Returns the value if it is a JSON object.
pub fn object(value: Option<&Value>) -> Option<&serde_json::Map<String, Value>> {
    value.and_then(Value::as_object)
}

/// Returns the elements of a list-like value: a plain array, or a host
/// collection exposing its items under `contents`.
pub fn list(value: Option<&Value>) -> &[Value] {
    match value {
        Some(Value::Array(items)) => items,
        Some(Value::Object(map)) => match map.get("contents") {
            Some(Value::Array(items)) => items,
            _ => &[],
        },
        _ => &[],
    }
}

/// Resolves a roll that may have been serialized to a JSON string.
///
/// Unparsable strings resolve to `None` and are treated as absent by callers.
pub fn resolve_roll(roll: &Value) -> Option<Cow<'_, Value>> {
    match roll {
        Value::Null => None,
        Value::String(raw) => serde_json::from_str::<Value>(raw)
            .ok()
            .filter(Value::is_object)
            .map(Cow::Owned),
        Value::Object(_) => Some(Cow::Borrowed(roll)),
        _ => None,
    }
}
