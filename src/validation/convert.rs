//! Conversions between JSON values and CEL values

use cel_interpreter::Value;
use cel_interpreter::objects::Key;
use chrono::SecondsFormat;
use serde_json::Number;
use std::collections::HashMap;
use std::sync::Arc;

/// Convert a JSON value into a CEL value.
///
/// Integers map to CEL `int` whenever they fit, so probe fields such as
/// `status-code` compare against plain integer literals.
pub fn json_to_cel(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => number_to_cel(n),
        serde_json::Value::String(s) => Value::String(Arc::new(s.clone())),
        serde_json::Value::Array(items) => {
            Value::List(Arc::new(items.iter().map(json_to_cel).collect()))
        }
        serde_json::Value::Object(map) => {
            let converted: HashMap<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_to_cel(v)))
                .collect();
            Value::from(converted)
        }
    }
}

fn number_to_cel(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int(i)
    } else if let Some(u) = n.as_u64() {
        Value::UInt(u)
    } else {
        Value::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Convert a CEL value back into JSON. Bytes become (lossy) UTF-8 strings,
/// timestamps RFC 3339 strings and durations a seconds string like `1.5s`.
pub fn cel_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::UInt(u) => serde_json::Value::from(*u),
        Value::Float(f) => Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::String(s) => serde_json::Value::String(s.to_string()),
        Value::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(cel_to_json).collect()),
        Value::Map(map) => {
            let object = map
                .map
                .iter()
                .map(|(k, v)| (key_to_string(k), cel_to_json(v)))
                .collect();
            serde_json::Value::Object(object)
        }
        Value::Timestamp(ts) => {
            serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        }
        Value::Duration(d) => serde_json::Value::String(format!(
            "{}s",
            d.num_milliseconds() as f64 / 1000.0
        )),
        other => serde_json::Value::String(format!("{:?}", other)),
    }
}

fn key_to_string(key: &Key) -> String {
    match key {
        Key::Int(i) => i.to_string(),
        Key::Uint(u) => u.to_string(),
        Key::Bool(b) => b.to_string(),
        Key::String(s) => s.to_string(),
    }
}

/// Render a CEL value for substitution into a template string
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string(),
        Value::Null => "null".to_string(),
        // Lowercase so the rendered text reads back as a CEL bool
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        other => cel_to_json(other).to_string(),
    }
}
