//! Type coercion of the string-typed fields RouterOS returns on the wire.
//!
//! Every attribute value arrives as a string (`=key=value`); this module
//! normalizes keys and infers a JSON-native type for each value so upstream
//! consumers don't have to parse booleans and numbers by hand.

use std::collections::HashMap;

use serde_json::{Map, Value};

/// A single parsed RouterOS row: a JSON object with normalized keys and
/// coerced value types.
pub type RouterRow = Map<String, Value>;

/// Parse one raw attribute map (as assembled by the router core from a
/// `!re` sentence) into a [`RouterRow`].
pub fn parse_row(raw: &HashMap<String, String>) -> RouterRow {
    let mut row = Map::with_capacity(raw.len());
    for (key, value) in raw {
        let key = normalize_key(key);
        row.insert(key, coerce_value(value));
    }
    row
}

/// Normalize a JSON-native row as returned by the REST transport into the
/// identical key/value shape [`parse_row`] produces for the socket
/// protocol — keys stripped of a leading `.` and converted kebab->camelCase,
/// string values coerced to bool/number where they look like it. Without
/// this, REST reads would keep `.id`/`mac-address`-style keys while socket
/// reads return `id`/`macAddress`, breaking the "uniform shape regardless
/// of transport" guarantee (§4.J) and the joins/mirrors that key off the
/// normalized field names.
pub fn normalize_row(raw: RouterRow) -> RouterRow {
    let mut row = Map::with_capacity(raw.len());
    for (key, value) in raw {
        let key = normalize_key(&key);
        let value = match value {
            Value::String(s) => coerce_value(&s),
            other => other,
        };
        row.insert(key, value);
    }
    row
}

/// Strip a leading `.` and convert `kebab-case` to `camelCase`.
fn normalize_key(key: &str) -> String {
    let key = key.strip_prefix('.').unwrap_or(key);
    let mut out = String::with_capacity(key.len());
    let mut upcase_next = false;
    for ch in key.chars() {
        if ch == '-' {
            upcase_next = true;
            continue;
        }
        if upcase_next {
            out.extend(ch.to_uppercase());
            upcase_next = false;
        } else {
            out.push(ch);
        }
    }
    out
}

/// Coerce a raw string value into its inferred JSON type.
///
/// - `"true"`/`"yes"` -> `true`, `"false"`/`"no"` -> `false` (case-sensitive,
///   matching the exact tokens RouterOS emits).
/// - A numeric-looking string with at most one `.` becomes a number. Values
///   with two or more dots (IP addresses, multi-segment version strings
///   such as `7.15.3`) are left as strings because they are not arithmetic
///   quantities even though every character is a digit or a dot.
/// - Everything else stays a string.
fn coerce_value(value: &str) -> Value {
    match value {
        "true" | "yes" => return Value::Bool(true),
        "false" | "no" => return Value::Bool(false),
        _ => {}
    }
    if is_numeric_looking(value) {
        if let Ok(n) = value.parse::<i64>() {
            return Value::Number(n.into());
        }
        if let Ok(f) = value.parse::<f64>() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    Value::String(value.to_owned())
}

fn is_numeric_looking(value: &str) -> bool {
    let body = value.strip_prefix('-').unwrap_or(value);
    if body.is_empty() {
        return false;
    }
    let dot_count = body.matches('.').count();
    if dot_count > 1 {
        return false;
    }
    body.chars().all(|c| c.is_ascii_digit() || c == '.')
        && body.chars().next().is_some_and(|c| c.is_ascii_digit())
}
