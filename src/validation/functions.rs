//! Helper functions available inside validation expressions

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cel_interpreter::{ExecutionError, Value};
use std::sync::Arc;

use super::convert::json_to_cel;

fn function_error(function: &str, message: impl ToString) -> ExecutionError {
    ExecutionError::FunctionError {
        function: function.to_string(),
        message: message.to_string(),
    }
}

/// `parse_json(string) -> value`
pub fn parse_json(input: Arc<String>) -> Result<Value, ExecutionError> {
    let parsed: serde_json::Value =
        serde_json::from_str(&input).map_err(|e| function_error("parse_json", e))?;
    Ok(json_to_cel(&parsed))
}

/// `parse_yaml(string) -> value`
pub fn parse_yaml(input: Arc<String>) -> Result<Value, ExecutionError> {
    let parsed: serde_json::Value =
        serde_yaml::from_str(&input).map_err(|e| function_error("parse_yaml", e))?;
    Ok(json_to_cel(&parsed))
}

/// `b64encode(string) -> string`
pub fn b64encode(input: Arc<String>) -> Result<Value, ExecutionError> {
    Ok(Value::String(Arc::new(STANDARD.encode(input.as_bytes()))))
}

/// `b64decode(string) -> string`, the decoded bytes must be UTF-8
pub fn b64decode(input: Arc<String>) -> Result<Value, ExecutionError> {
    let bytes = STANDARD
        .decode(input.as_bytes())
        .map_err(|e| function_error("b64decode", e))?;
    let decoded = String::from_utf8(bytes).map_err(|e| function_error("b64decode", e))?;
    Ok(Value::String(Arc::new(decoded)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(value: &str) -> Arc<String> {
        Arc::new(value.to_string())
    }

    #[test]
    fn test_base64_round_trip() {
        let encoded = b64encode(s("hello")).unwrap();
        assert_eq!(encoded, Value::String(s("aGVsbG8=")));
        assert_eq!(b64decode(s("aGVsbG8=")).unwrap(), Value::String(s("hello")));
    }

    #[test]
    fn test_b64decode_rejects_garbage() {
        assert!(b64decode(s("not base64!!")).is_err());
    }

    #[test]
    fn test_parse_yaml_mapping() {
        let value = parse_yaml(s("key: value\ncount: 3\n")).unwrap();
        let json = super::super::convert::cel_to_json(&value);
        assert_eq!(json["key"], "value");
        assert_eq!(json["count"], 3);
    }

    #[test]
    fn test_parse_json_error() {
        assert!(parse_json(s("{not json")).is_err());
    }
}
