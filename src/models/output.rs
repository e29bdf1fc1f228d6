//! Probe output document
//!
//! Written by `netcheck run` to stdout and read back by the operator from the
//! probe pod's log.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Value of the output document's `type` field
pub const OUTPUT_TYPE: &str = "netcheck-output";

/// Output format version. Set to v1 once stable.
pub const OUTPUT_VERSION: &str = "dev";

/// Verdict of a single check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pass,
    Fail,
    Error,
    Skip,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pass => "pass",
            Status::Fail => "fail",
            Status::Error => "error",
            Status::Skip => "skip",
        }
    }
}

/// Result of one probe call
///
/// `spec` echoes the request parameters (plus the validation `pattern`),
/// `data` carries the observations. `status` is set only after validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(default)]
    pub spec: Map<String, Value>,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Optional rule name carried into the PolicyReport
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Context values, only present when the runner was asked to include them
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ResultRecord {
    /// Start a record for a probe of the given type, stamping `startTimestamp`
    pub fn start(probe_type: &str) -> Self {
        let mut record = Self::default();
        record
            .spec
            .insert("type".to_string(), Value::String(probe_type.to_string()));
        record
            .data
            .insert("startTimestamp".to_string(), Value::String(now_rfc3339()));
        record
    }

    /// Stamp `endTimestamp`
    pub fn finish(mut self) -> Self {
        self.data
            .insert("endTimestamp".to_string(), Value::String(now_rfc3339()));
        self
    }

    /// Record a probe failure as exception type and message
    pub fn set_exception(&mut self, kind: &str, message: impl Into<String>) {
        self.data
            .insert("exception-type".to_string(), Value::String(kind.to_string()));
        self.data
            .insert("exception".to_string(), Value::String(message.into()));
    }

    pub fn probe_type(&self) -> Option<&str> {
        self.spec.get("type").and_then(Value::as_str)
    }

    pub fn start_timestamp(&self) -> Option<&str> {
        self.data.get("startTimestamp").and_then(Value::as_str)
    }

    pub fn end_timestamp(&self) -> Option<&str> {
        self.data.get("endTimestamp").and_then(Value::as_str)
    }

    /// Wall-clock duration of the probe call in seconds
    pub fn duration_secs(&self) -> Option<f64> {
        let start = parse_timestamp(self.start_timestamp()?)?;
        let end = parse_timestamp(self.end_timestamp()?)?;
        Some((end - start).num_milliseconds() as f64 / 1000.0)
    }
}

/// Results of one assertion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    pub name: String,
    #[serde(default)]
    pub results: Vec<ResultRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMetadata {
    pub creation_timestamp: String,
    pub version: String,
}

/// The document `netcheck run` prints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDocument {
    #[serde(rename = "type")]
    pub output_type: String,
    pub output_version: String,
    pub metadata: OutputMetadata,
    #[serde(default)]
    pub assertions: Vec<AssertionResult>,
}

impl OutputDocument {
    pub fn new() -> Self {
        Self {
            output_type: OUTPUT_TYPE.to_string(),
            output_version: OUTPUT_VERSION.to_string(),
            metadata: OutputMetadata {
                creation_timestamp: now_rfc3339(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            assertions: Vec::new(),
        }
    }

    /// Iterate `(assertion name, result)` pairs in document order
    pub fn results(&self) -> impl Iterator<Item = (&str, &ResultRecord)> {
        self.assertions
            .iter()
            .flat_map(|a| a.results.iter().map(move |r| (a.name.as_str(), r)))
    }
}

impl Default for OutputDocument {
    fn default() -> Self {
        Self::new()
    }
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an ISO-8601 timestamp. Naive timestamps are taken as UTC.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
