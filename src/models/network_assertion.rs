//! NetworkAssertion custom resource
//!
//! The user-authored resource. Rules and context definitions are kept as open
//! JSON maps so that type-specific parameters (and anything newer probes
//! understand) pass through to the generated ConfigMap untouched.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// API group for the NetworkAssertion CRD
pub const API_GROUP: &str = "netchecks.io";

/// Spec of a NetworkAssertion
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "netchecks.io",
    version = "v1",
    kind = "NetworkAssertion",
    plural = "networkassertions",
    shortname = "na",
    namespaced
)]
#[kube(status = "NetworkAssertionStatus")]
#[kube(printcolumn = r#"{"name":"Schedule", "jsonPath": ".spec.schedule", "type": "string"}"#)]
pub struct NetworkAssertionSpec {
    /// Checks to run. Must not be empty.
    #[serde(default)]
    #[schemars(schema_with = "open_object_list")]
    pub rules: Vec<Rule>,

    /// Named data sources made available to templates and validation rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[schemars(schema_with = "open_object_list")]
    pub context: Vec<ContextDef>,

    /// Five-field cron schedule. When set a CronJob is created instead of a Job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,

    /// Partial pod template merged over the generated probe pod template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "open_object")]
    pub template: Option<Value>,

    /// Keep sensitive fields (headers) in results
    #[serde(default)]
    pub disable_redaction: bool,
}

/// Status written after the create path has run
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct NetworkAssertionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation: Option<CreationStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CreationStatus {
    #[serde(rename = "job-name")]
    pub job_name: String,
    #[serde(rename = "job-uid", default)]
    pub job_uid: String,
}

/// Supported rule types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Dns,
    Http,
    Internal,
}

impl RuleType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "dns" => Some(RuleType::Dns),
            "http" => Some(RuleType::Http),
            "internal" => Some(RuleType::Internal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::Dns => "dns",
            RuleType::Http => "http",
            RuleType::Internal => "internal",
        }
    }
}

/// Expected outcome of a rule. `Fail` inverts the validation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expected {
    #[default]
    Pass,
    Fail,
}

/// One check inside a NetworkAssertion
///
/// Stored as the raw JSON object. `type` selects the probe; everything else
/// is a probe parameter, plus the optional `name`, `expected`, `validation`
/// and legacy `validate.pattern` keys.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(transparent)]
pub struct Rule(pub Map<String, Value>);

impl Rule {
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Rule(map)),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Raw `type` value as authored
    pub fn type_name(&self) -> Option<&str> {
        self.get_str("type")
    }

    pub fn rule_type(&self) -> Option<RuleType> {
        self.type_name().and_then(RuleType::parse)
    }

    pub fn name(&self) -> Option<&str> {
        self.get_str("name")
    }

    pub fn expected(&self) -> Expected {
        match self.get_str("expected") {
            Some("fail") => Expected::Fail,
            _ => Expected::Pass,
        }
    }

    /// Validation expression, accepting both `validation` and the CRD's
    /// `validate.pattern` form
    pub fn validation(&self) -> Option<&str> {
        self.get_str("validation").or_else(|| {
            self.0
                .get("validate")
                .and_then(|v| v.get("pattern"))
                .and_then(Value::as_str)
        })
    }

    /// Copy of the rule as the probe CLI expects it: `validate.pattern` is
    /// moved to `validation`.
    pub fn for_config_file(&self) -> Rule {
        let mut rule = self.0.clone();
        let pattern = rule
            .get_mut("validate")
            .and_then(Value::as_object_mut)
            .and_then(|validate| validate.remove("pattern"));
        if let Some(pattern) = pattern {
            rule.insert("validation".to_string(), pattern);
        }
        Rule(rule)
    }
}

/// A named context definition: exactly one of configMap, secret or inline
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextDef {
    pub name: String,

    /// ConfigMap volume source (`name`, `items`, `optional`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map: Option<Map<String, Value>>,

    /// Secret volume source. `name` is accepted in place of `secretName`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<Map<String, Value>>,

    /// Structured data substituted at template time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<Value>,
}

/// Directory where configMap/secret contexts are mounted in the probe pod
pub fn context_mount_path(name: &str) -> String {
    format!("/mnt/{}", name)
}

fn open_object(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true
    })
}

fn open_object_list(_: &mut schemars::SchemaGenerator) -> schemars::Schema {
    schemars::json_schema!({
        "type": "array",
        "items": {
            "type": "object",
            "x-kubernetes-preserve-unknown-fields": true
        }
    })
}
