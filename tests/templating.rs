//! Template substitution tests
//!
//! Rules in the probe configuration may reference context data with
//! `{{ expression }}`. These tests run whole configurations through the
//! runner with a recording probe executor and check what the probe saw.

use std::sync::Mutex;

use async_trait::async_trait;
use netchecks::checks::ProbeExecutor;
use netchecks::context::{ContextError, replace_templates, resolve_contexts};
use netchecks::models::{ContextEntry, ResolvedConfig, ResultRecord, Rule, RuleType, Status};
use netchecks::runner::{RunError, RunOptions, run_with_executor};
use serde_json::{Value, json};

/// Records every rule it is asked to run and answers with a 200 response
#[derive(Default)]
struct RecordingExecutor {
    seen: Mutex<Vec<Rule>>,
}

#[async_trait]
impl ProbeExecutor for RecordingExecutor {
    async fn execute(&self, _rule_type: RuleType, rule: &Rule) -> ResultRecord {
        self.seen.lock().unwrap().push(rule.clone());

        let mut record = ResultRecord::start("http");
        if let Some(url) = rule.get("url") {
            record.spec.insert("url".into(), url.clone());
        }
        if let Some(headers) = rule.get("headers") {
            record.spec.insert("headers".into(), headers.clone());
        }
        record.data.insert("status-code".into(), json!(200));
        record.finish()
    }
}

fn config(value: Value) -> ResolvedConfig {
    serde_json::from_value(value).unwrap()
}

#[tokio::test]
async fn test_inline_context_substituted_into_rule() {
    let config = config(json!({
        "contexts": [
            {"type": "inline", "name": "target", "data": {"host": "example.test", "port": 8443}}
        ],
        "assertions": [{
            "name": "web",
            "rules": [{"type": "http", "url": "https://{{ target.host }}:{{ target.port }}/health"}]
        }]
    }));
    let executor = RecordingExecutor::default();

    let output = run_with_executor(&config, &RunOptions::default(), &executor)
        .await
        .unwrap();

    let seen = executor.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].get("url").unwrap(), "https://example.test:8443/health");

    let (name, result) = output.results().next().unwrap();
    assert_eq!(name, "web");
    assert_eq!(result.status, Some(Status::Pass));
}

#[tokio::test]
async fn test_directory_context_from_mounted_files() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("token"), "s3cr3t").unwrap();
    std::fs::write(dir.path().join("host"), "api.example.test").unwrap();

    let config = config(json!({
        "contexts": [
            {"type": "directory", "name": "creds", "path": dir.path().display().to_string()}
        ],
        "assertions": [{
            "name": "api",
            "rules": [{
                "type": "http",
                "url": "https://{{ creds.host }}/v1",
                "headers": {"Authorization": "Bearer {{ creds.token }}"}
            }]
        }]
    }));
    let executor = RecordingExecutor::default();

    let output = run_with_executor(&config, &RunOptions::default(), &executor)
        .await
        .unwrap();

    let seen = executor.seen.lock().unwrap();
    assert_eq!(seen[0].get("url").unwrap(), "https://api.example.test/v1");
    assert_eq!(
        seen[0].get("headers").unwrap(),
        &json!({"Authorization": "Bearer s3cr3t"})
    );

    // Headers never reach the output unless redaction is disabled
    let (_, result) = output.results().next().unwrap();
    assert_eq!(result.spec["headers"], "REDACTED");
}

#[tokio::test]
async fn test_context_values_usable_in_validation() {
    let config = config(json!({
        "contexts": [
            {"type": "inline", "name": "expect", "data": {"code": 200}}
        ],
        "assertions": [{
            "name": "web",
            "rules": [{
                "type": "http",
                "url": "https://example.test",
                "validation": "data['status-code'] == expect.code"
            }]
        }]
    }));
    let executor = RecordingExecutor::default();
    let options = RunOptions {
        include_context: true,
        ..Default::default()
    };

    let output = run_with_executor(&config, &options, &executor).await.unwrap();

    let (_, result) = output.results().next().unwrap();
    assert_eq!(result.status, Some(Status::Pass));
    assert_eq!(result.spec["pattern"], "data['status-code'] == expect.code");
    assert_eq!(result.extra["expect"], json!({"code": 200}));
}

#[test]
fn test_file_context_read_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, r#"{"path": "/status"}"#).unwrap();

    let contexts = resolve_contexts(&[ContextEntry::File {
        name: "settings".into(),
        path: path.display().to_string(),
    }])
    .unwrap();

    let template = json!({"url": "https://example.test{{ settings.path }}"});
    let rendered = replace_templates(&template, &contexts).unwrap();
    assert_eq!(rendered, json!({"url": "https://example.test/status"}));
}

#[tokio::test]
async fn test_missing_file_context_is_a_configuration_error() {
    let config = config(json!({
        "contexts": [{"type": "file", "name": "gone", "path": "/nonexistent/netchecks/ctx.json"}],
        "assertions": []
    }));

    let err = run_with_executor(&config, &RunOptions::default(), &RecordingExecutor::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Context(ContextError::Io { .. })));
}

#[tokio::test]
async fn test_template_syntax_error_is_reported() {
    let config = config(json!({
        "assertions": [{
            "name": "web",
            "rules": [{"type": "http", "url": "https://{{ target. }}/"}]
        }]
    }));

    let executor = RecordingExecutor::default();
    let err = run_with_executor(&config, &RunOptions::default(), &executor)
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Context(ContextError::Eval(_))));
    assert!(executor.seen.lock().unwrap().is_empty());
}
