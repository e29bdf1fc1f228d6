//! HTTP request check

use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use serde_json::{Map, Value};

use crate::models::ResultRecord;

const DEFAULT_USER_AGENT: &str = "netcheck";

/// Issue one HTTP request and record status code, headers and body.
///
/// A non-2xx status is recorded both as `status-code` and as an `HTTPError`
/// exception; the validation rule decides what that means.
pub async fn http_request_check(
    url: &str,
    method: &str,
    mut headers: Map<String, Value>,
    timeout: f64,
    verify: bool,
) -> ResultRecord {
    if !headers.keys().any(|k| k.eq_ignore_ascii_case("user-agent")) {
        headers.insert(
            "User-Agent".to_string(),
            Value::String(DEFAULT_USER_AGENT.to_string()),
        );
    }

    let mut record = ResultRecord::start("http");
    record.spec.insert("shouldFail".to_string(), Value::Bool(false));
    record
        .spec
        .insert("timeout".to_string(), super::timeout_value(timeout));
    record
        .spec
        .insert("verify-tls-cert".to_string(), Value::Bool(verify));
    record
        .spec
        .insert("method".to_string(), Value::String(method.to_string()));
    record
        .spec
        .insert("headers".to_string(), Value::Object(headers.clone()));
    record
        .spec
        .insert("url".to_string(), Value::String(url.to_string()));

    if let Err((kind, message)) = send(&mut record, url, method, &headers, timeout, verify).await {
        tracing::debug!("Caught exception: {}: {}", kind, message);
        record.set_exception(kind, message);
    }

    record.finish()
}

async fn send(
    record: &mut ResultRecord,
    url: &str,
    method: &str,
    headers: &Map<String, Value>,
    timeout: f64,
    verify: bool,
) -> Result<(), (&'static str, String)> {
    let method = Method::from_bytes(method.to_uppercase().as_bytes())
        .map_err(|e| ("ValueError", e.to_string()))?;
    let header_map = to_header_map(headers)?;

    let client = reqwest::Client::builder()
        .timeout(super::to_duration(timeout))
        .danger_accept_invalid_certs(!verify)
        .build()
        .map_err(|e| ("ClientError", e.to_string()))?;

    let response = client
        .request(method, url)
        .headers(header_map)
        .send()
        .await
        .map_err(|e| (classify(&e), e.to_string()))?;

    let status = response.status();
    let response_headers: Map<String, Value> = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                canonical_header_name(name.as_str()),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();

    record
        .data
        .insert("status-code".to_string(), Value::from(status.as_u16()));
    record
        .data
        .insert("headers".to_string(), Value::Object(response_headers));

    let body = response
        .text()
        .await
        .map_err(|e| (classify(&e), e.to_string()))?;
    record.data.insert("body".to_string(), Value::String(body));

    if status.is_client_error() || status.is_server_error() {
        let side = if status.is_client_error() {
            "Client"
        } else {
            "Server"
        };
        return Err((
            "HTTPError",
            format!(
                "{} {} Error: {} for url: {}",
                status.as_u16(),
                side,
                status.canonical_reason().unwrap_or("Unknown"),
                url
            ),
        ));
    }

    Ok(())
}

fn to_header_map(headers: &Map<String, Value>) -> Result<HeaderMap, (&'static str, String)> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ("InvalidHeader", format!("{name}: {e}")))?;
        let value = value.as_str().unwrap_or_default();
        let value = HeaderValue::from_str(value)
            .map_err(|e| ("InvalidHeader", format!("{name}: {e}")))?;
        map.insert(name, value);
    }
    if !map.contains_key(USER_AGENT) {
        map.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
    }
    Ok(map)
}

fn classify(error: &reqwest::Error) -> &'static str {
    if error.is_timeout() {
        "Timeout"
    } else if error.is_connect() {
        "ConnectionError"
    } else if error.is_builder() {
        "InvalidURL"
    } else if error.is_decode() || error.is_body() {
        "ContentDecodingError"
    } else {
        "RequestException"
    }
}

/// `content-type` -> `Content-Type`
fn canonical_header_name(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("content-type"), "Content-Type");
        assert_eq!(canonical_header_name("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_name("server"), "Server");
    }

    #[test]
    fn test_user_agent_added_to_header_map() {
        let map = to_header_map(&Map::new()).unwrap();
        assert_eq!(map[USER_AGENT], "netcheck");
    }

    #[tokio::test]
    async fn test_default_user_agent_recorded_in_spec() {
        let record = http_request_check("not a url", "get", Map::new(), 1.0, true).await;
        assert_eq!(record.spec["headers"]["User-Agent"], "netcheck");
        assert_eq!(record.spec["method"], "get");
        assert_eq!(record.spec["verify-tls-cert"], true);
        assert!(record.data.contains_key("exception-type"));
        assert!(!record.data.contains_key("status-code"));
    }

    #[tokio::test]
    async fn test_invalid_method_recorded() {
        let record =
            http_request_check("http://localhost:1", "not a method", Map::new(), 1.0, true).await;
        assert_eq!(record.data["exception-type"], "ValueError");
    }
}
