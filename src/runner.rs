//! Rule runner
//!
//! Executes the probe configuration written by the operator: resolve
//! contexts, substitute templates, run each rule's probe, then validate the
//! result and settle its status.

use serde_json::Value;

use crate::checks::{NetworkProbes, ProbeExecutor};
use crate::context::{ContextError, ContextMap, replace_templates, resolve_contexts};
use crate::models::{
    AssertionConfig, AssertionResult, Expected, OutputDocument, ResolvedConfig, ResultRecord,
    Rule, RuleType, Status,
};
use crate::validation::{
    Activation, DEFAULT_DNS_VALIDATION_RULE, DEFAULT_HTTP_VALIDATION_RULE,
    DEFAULT_INTERNAL_VALIDATION_RULE, EvalError, Validator,
};

/// Fields replaced with [`REDACTED`] in result records
pub const SENSITIVE_FIELDS: &[&str] = &["headers"];

pub const REDACTED: &str = "REDACTED";

/// Runner errors. All of them are configuration problems; probe failures
/// are recorded in the result instead.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error("Unknown rule type '{rule_type}' in assertion '{assertion}'")]
    UnknownRuleType { assertion: String, rule_type: String },

    #[error("Invalid configuration after template substitution: {0}")]
    InvalidConfig(#[source] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Keep `headers` and similar fields in the output
    pub disable_redaction: bool,
    /// Log progress at info level
    pub verbose: bool,
    /// Copy context values into each result record
    pub include_context: bool,
}

/// Run every assertion in `config` against the network
pub async fn run_from_config(
    config: &ResolvedConfig,
    options: &RunOptions,
) -> Result<OutputDocument, RunError> {
    run_with_executor(config, options, &NetworkProbes).await
}

/// Run every assertion in `config` with the given probe executor
pub async fn run_with_executor(
    config: &ResolvedConfig,
    options: &RunOptions,
    executor: &dyn ProbeExecutor,
) -> Result<OutputDocument, RunError> {
    if options.verbose {
        tracing::info!("Loaded {} assertions", config.assertions.len());
    }

    let contexts = resolve_contexts(&config.contexts)?;
    let assertions = substitute_assertions(&config.assertions, &contexts)?;

    let mut output = OutputDocument::new();
    for assertion in &assertions {
        if options.verbose {
            tracing::info!("Running tests for assertion '{}'", assertion.name);
        }
        let mut results = Vec::with_capacity(assertion.rules.len());
        for rule in &assertion.rules {
            let rule_type = rule_type_of(&assertion.name, rule)?;
            let record = executor.execute(rule_type, rule).await;
            results.push(evaluate_result(record, rule, rule_type, &contexts, options)?);
        }
        output.assertions.push(AssertionResult {
            name: assertion.name.clone(),
            results,
        });
    }

    Ok(output)
}

/// Validate one probe result and set its final status.
///
/// Attaches `spec.pattern`, evaluates the rule's validation expression (or
/// the default for its type), strips or includes context values, redacts
/// sensitive fields and applies `expected: fail` inversion.
pub fn evaluate_result(
    mut record: ResultRecord,
    rule: &Rule,
    rule_type: RuleType,
    contexts: &ContextMap,
    options: &RunOptions,
) -> Result<ResultRecord, RunError> {
    let pattern = rule
        .validation()
        .unwrap_or_else(|| default_validation_rule(rule_type));
    if rule.validation().is_some() && options.verbose {
        tracing::info!("Using custom validation rule");
    }
    record
        .spec
        .insert("pattern".to_string(), Value::String(pattern.to_string()));

    let validator = Validator::compile(pattern)?;
    let context_values = contexts.materialize()?;
    let activation = Activation::for_result(
        &record.spec,
        &record.data,
        context_values.iter().map(|(name, value)| (*name, value.clone())),
    )?;

    tracing::info!("Validating probe result with rule: {}", pattern);
    let passed = validator.evaluate(&activation);

    if options.include_context {
        for (name, value) in context_values {
            record.extra.insert(name.to_string(), value);
        }
    }

    if !options.disable_redaction {
        redact(&mut record);
    }

    let status = match (rule.expected(), passed) {
        (Expected::Pass, true) | (Expected::Fail, false) => Status::Pass,
        (Expected::Pass, false) | (Expected::Fail, true) => Status::Fail,
    };
    record.status = Some(status);
    if record.name.is_none() {
        record.name = rule.name().map(str::to_string);
    }

    Ok(record)
}

/// Replace sensitive fields in `spec` and `data`
pub fn redact(record: &mut ResultRecord) {
    for field in SENSITIVE_FIELDS {
        for section in [&mut record.spec, &mut record.data] {
            if let Some(value) = section.get_mut(*field) {
                *value = Value::String(REDACTED.to_string());
            }
        }
    }
}

pub fn default_validation_rule(rule_type: RuleType) -> &'static str {
    match rule_type {
        RuleType::Dns => DEFAULT_DNS_VALIDATION_RULE,
        RuleType::Http => DEFAULT_HTTP_VALIDATION_RULE,
        RuleType::Internal => DEFAULT_INTERNAL_VALIDATION_RULE,
    }
}

fn rule_type_of(assertion: &str, rule: &Rule) -> Result<RuleType, RunError> {
    rule.rule_type().ok_or_else(|| RunError::UnknownRuleType {
        assertion: assertion.to_string(),
        rule_type: rule.type_name().unwrap_or("<missing>").to_string(),
    })
}

fn substitute_assertions(
    assertions: &[AssertionConfig],
    contexts: &ContextMap,
) -> Result<Vec<AssertionConfig>, RunError> {
    let raw = serde_json::to_value(assertions).map_err(RunError::InvalidConfig)?;
    let rendered = replace_templates(&raw, contexts)?;
    serde_json::from_value(rendered).map_err(RunError::InvalidConfig)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::MockProbeExecutor;
    use crate::context::ContextValue;
    use crate::models::ContextEntry;
    use serde_json::json;

    fn rule(value: Value) -> Rule {
        Rule::from_value(value).unwrap()
    }

    fn http_record(status_code: u16) -> ResultRecord {
        let mut record = ResultRecord::start("http");
        record
            .spec
            .insert("headers".to_string(), json!({"Authorization": "Bearer x"}));
        record
            .data
            .insert("status-code".to_string(), json!(status_code));
        record.finish()
    }

    #[test]
    fn test_default_rule_passes() {
        let record = evaluate_result(
            http_record(200),
            &rule(json!({"type": "http", "url": "https://example.test/ok"})),
            RuleType::Http,
            &ContextMap::new(),
            &RunOptions::default(),
        )
        .unwrap();
        assert_eq!(record.status, Some(Status::Pass));
        assert_eq!(record.spec["pattern"], DEFAULT_HTTP_VALIDATION_RULE);
        assert_eq!(record.spec["headers"], REDACTED);
    }

    #[test]
    fn test_expected_fail_inverts() {
        let record = evaluate_result(
            http_record(403),
            &rule(json!({"type": "http", "expected": "fail"})),
            RuleType::Http,
            &ContextMap::new(),
            &RunOptions::default(),
        )
        .unwrap();
        assert_eq!(record.status, Some(Status::Pass));
    }

    #[test]
    fn test_disable_redaction_keeps_headers() {
        let options = RunOptions {
            disable_redaction: true,
            ..Default::default()
        };
        let record = evaluate_result(
            http_record(200),
            &rule(json!({"type": "http"})),
            RuleType::Http,
            &ContextMap::new(),
            &options,
        )
        .unwrap();
        assert_eq!(record.spec["headers"]["Authorization"], "Bearer x");
    }

    #[test]
    fn test_context_included_only_when_asked() {
        let mut contexts = ContextMap::new();
        contexts.insert("expected", ContextValue::Value(json!({"code": 200})));
        let custom = rule(json!({"type": "http", "validation": "data['status-code'] == expected.code"}));

        let stripped = evaluate_result(
            http_record(200),
            &custom,
            RuleType::Http,
            &contexts,
            &RunOptions::default(),
        )
        .unwrap();
        assert_eq!(stripped.status, Some(Status::Pass));
        assert!(stripped.extra.is_empty());

        let included = evaluate_result(
            http_record(200),
            &custom,
            RuleType::Http,
            &contexts,
            &RunOptions {
                include_context: true,
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(included.extra["expected"], json!({"code": 200}));
    }

    #[test]
    fn test_invalid_validation_is_an_error() {
        let err = evaluate_result(
            http_record(200),
            &rule(json!({"type": "http", "validation": "data['status-code'] =="})),
            RuleType::Http,
            &ContextMap::new(),
            &RunOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, RunError::Eval(EvalError::Syntax { .. })));
    }

    #[tokio::test]
    async fn test_run_with_mock_executor_substitutes_templates() {
        let mut executor = MockProbeExecutor::new();
        executor
            .expect_execute()
            .withf(|rule_type, rule| {
                *rule_type == RuleType::Http
                    && rule.get("url") == Some(&json!("https://example.test/ok"))
            })
            .times(1)
            .returning(|_, _| http_record(200));

        let config = ResolvedConfig {
            contexts: vec![ContextEntry::Inline {
                name: "target".into(),
                data: json!({"host": "example.test"}),
            }],
            assertions: vec![AssertionConfig {
                name: "http-check".into(),
                rules: vec![rule(json!({
                    "name": "http-check",
                    "type": "http",
                    "url": "https://{{ target.host }}/ok"
                }))],
            }],
        };

        let output = run_with_executor(&config, &RunOptions::default(), &executor)
            .await
            .unwrap();
        assert_eq!(output.assertions.len(), 1);
        assert_eq!(output.assertions[0].results[0].status, Some(Status::Pass));
        assert_eq!(
            output.assertions[0].results[0].name.as_deref(),
            Some("http-check")
        );
    }

    #[tokio::test]
    async fn test_unknown_rule_type_is_a_config_error() {
        let executor = MockProbeExecutor::new();
        let config = ResolvedConfig {
            contexts: vec![],
            assertions: vec![AssertionConfig {
                name: "odd".into(),
                rules: vec![rule(json!({"type": "icmp"}))],
            }],
        };
        let err = run_with_executor(&config, &RunOptions::default(), &executor)
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::UnknownRuleType { ref rule_type, .. } if rule_type == "icmp"));
    }
}
