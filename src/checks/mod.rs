//! Probe executors
//!
//! Each check performs one network observation and returns a
//! [`ResultRecord`] with `spec` echoing the request and `data` holding what
//! was observed. Probe failures never surface as `Err`: they are recorded as
//! `data.exception-type` / `data.exception` so validation can judge them.

pub mod dns;
pub mod http;
pub mod internal;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

use crate::models::{ResultRecord, Rule, RuleType};

/// Default DNS lifetime in seconds
pub const DEFAULT_DNS_TIMEOUT_SECS: f64 = 10.0;

/// Default HTTP request timeout in seconds
pub const DEFAULT_HTTP_TIMEOUT_SECS: f64 = 5.0;

/// Default internal check timeout in seconds
pub const DEFAULT_INTERNAL_TIMEOUT_SECS: f64 = 5.0;

/// Runs one rule's probe
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn execute(&self, rule_type: RuleType, rule: &Rule) -> ResultRecord;
}

/// Executes probes against the real network
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkProbes;

#[async_trait]
impl ProbeExecutor for NetworkProbes {
    async fn execute(&self, rule_type: RuleType, rule: &Rule) -> ResultRecord {
        match rule_type {
            RuleType::Dns => {
                let host = rule.get("host").and_then(Value::as_str).unwrap_or_default();
                let server = rule.get("server").and_then(Value::as_str);
                let timeout = timeout_secs(rule, DEFAULT_DNS_TIMEOUT_SECS);
                tracing::info!("DNS check looking up host '{}'", host);
                dns::dns_lookup_check(host, server, timeout).await
            }
            RuleType::Http => {
                let url = rule.get("url").and_then(Value::as_str).unwrap_or_default();
                let method = rule
                    .get("method")
                    .and_then(Value::as_str)
                    .unwrap_or("get")
                    .to_lowercase();
                let headers = string_map(rule.get("headers"));
                let timeout = timeout_secs(rule, DEFAULT_HTTP_TIMEOUT_SECS);
                let verify = rule
                    .get("verify-tls-cert")
                    .and_then(Value::as_bool)
                    .unwrap_or(true);
                tracing::info!("http check with url '{}'", url);
                http::http_request_check(url, &method, headers, timeout, verify).await
            }
            RuleType::Internal => {
                internal::internal_check(timeout_secs(rule, DEFAULT_INTERNAL_TIMEOUT_SECS))
            }
        }
    }
}

/// `timeout` as seconds, accepting integers, floats and numeric strings
pub fn timeout_secs(rule: &Rule, default: f64) -> f64 {
    match rule.get("timeout") {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
        _ => default,
    }
}

pub(crate) fn to_duration(secs: f64) -> Duration {
    if secs.is_finite() && secs > 0.0 {
        Duration::from_secs_f64(secs)
    } else {
        Duration::from_secs_f64(DEFAULT_HTTP_TIMEOUT_SECS)
    }
}

/// JSON number for a timeout, integral when possible
pub(crate) fn timeout_value(secs: f64) -> Value {
    if secs.fract() == 0.0 && secs >= 0.0 && secs <= u32::MAX as f64 {
        Value::from(secs as u64)
    } else {
        Value::from(secs)
    }
}

fn string_map(value: Option<&Value>) -> Map<String, Value> {
    let Some(Value::Object(map)) = value else {
        return Map::new();
    };
    map.iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => Value::String(s.clone()),
                other => Value::String(other.to_string()),
            };
            (k.clone(), v)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rule(value: Value) -> Rule {
        Rule::from_value(value).unwrap()
    }

    #[test]
    fn test_timeout_secs_parsing() {
        assert_eq!(timeout_secs(&rule(json!({"timeout": 3})), 5.0), 3.0);
        assert_eq!(timeout_secs(&rule(json!({"timeout": 1.5})), 5.0), 1.5);
        assert_eq!(timeout_secs(&rule(json!({"timeout": "7"})), 5.0), 7.0);
        assert_eq!(timeout_secs(&rule(json!({})), 5.0), 5.0);
        assert_eq!(timeout_secs(&rule(json!({"timeout": "soon"})), 5.0), 5.0);
    }

    #[test]
    fn test_timeout_value_prefers_integers() {
        assert_eq!(timeout_value(10.0), json!(10));
        assert_eq!(timeout_value(2.5), json!(2.5));
    }

    #[test]
    fn test_header_values_stringified() {
        let headers = string_map(Some(&json!({"X-Count": 3, "Authorization": "Bearer t"})));
        assert_eq!(headers["X-Count"], "3");
        assert_eq!(headers["Authorization"], "Bearer t");
        assert!(string_map(Some(&json!("nope"))).is_empty());
    }

    #[tokio::test]
    async fn test_internal_rule_dispatch() {
        let record = NetworkProbes
            .execute(RuleType::Internal, &rule(json!({"type": "internal", "timeout": 2})))
            .await;
        assert_eq!(record.probe_type(), Some("internal"));
        assert_eq!(record.spec["timeout"], 2);
    }
}
