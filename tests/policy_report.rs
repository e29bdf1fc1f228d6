//! PolicyReport upsert tests
//!
//! Runs the report upsert against an in-memory store that behaves like the
//! API server for the calls the operator makes: label-selected lookup,
//! create (409 when the name exists) and merge patch (409 on a stale
//! resourceVersion).

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kube::ResourceExt;
use kube::api::DynamicObject;
use netchecks::models::{AssertionResult, OutputDocument, ResultRecord, Status};
use netchecks::operator::report::{ENGINE, ENGINE_LABEL};
use netchecks::operator::workload::LABEL_INSTANCE;
use netchecks::operator::{Error, ReportStore, Result, UpsertOutcome, upsert_report};
use serde_json::{Value, json};

#[derive(Default)]
struct InMemoryReports {
    reports: Mutex<BTreeMap<(String, String), DynamicObject>>,
    creates: Mutex<u32>,
    patches: Mutex<u32>,
    /// Number of upcoming patches to reject as if another writer got there first
    stale_patches: Mutex<u32>,
}

impl InMemoryReports {
    fn get(&self, namespace: &str, name: &str) -> Option<DynamicObject> {
        self.reports
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn creates(&self) -> u32 {
        *self.creates.lock().unwrap()
    }

    fn patches(&self) -> u32 {
        *self.patches.lock().unwrap()
    }
}

/// RFC 7386 JSON merge patch
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    let Value::Object(target) = target else {
        return;
    };
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

fn bump_version(report: &mut DynamicObject) {
    let next = report
        .resource_version()
        .and_then(|rv| rv.parse::<u64>().ok())
        .unwrap_or(0)
        + 1;
    report.metadata.resource_version = Some(next.to_string());
}

#[async_trait]
impl ReportStore for InMemoryReports {
    async fn find(&self, namespace: &str, assertion: &str) -> Result<Option<DynamicObject>> {
        let reports = self.reports.lock().unwrap();
        Ok(reports
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, report)| report)
            .find(|report| report.labels().get(LABEL_INSTANCE).map(String::as_str) == Some(assertion))
            .cloned())
    }

    async fn create(&self, namespace: &str, report: &DynamicObject) -> Result<DynamicObject> {
        let mut reports = self.reports.lock().unwrap();
        let key = (namespace.to_string(), report.name_any());
        if reports.contains_key(&key) {
            return Err(Error::Conflict { name: key.1 });
        }
        let mut stored = report.clone();
        bump_version(&mut stored);
        reports.insert(key, stored.clone());
        *self.creates.lock().unwrap() += 1;
        Ok(stored)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject> {
        {
            let mut stale = self.stale_patches.lock().unwrap();
            if *stale > 0 {
                *stale -= 1;
                return Err(Error::Conflict {
                    name: name.to_string(),
                });
            }
        }

        let mut reports = self.reports.lock().unwrap();
        let key = (namespace.to_string(), name.to_string());
        let Some(current) = reports.get(&key) else {
            return Err(Error::MissingField {
                kind: "PolicyReport",
                name: name.to_string(),
                field: "metadata",
            });
        };
        if patch["metadata"]["resourceVersion"].as_str() != current.resource_version().as_deref() {
            return Err(Error::Conflict {
                name: name.to_string(),
            });
        }

        let mut raw = serde_json::to_value(current).unwrap();
        merge_patch(&mut raw, patch);
        let mut updated: DynamicObject = serde_json::from_value(raw).unwrap();
        bump_version(&mut updated);
        reports.insert(key, updated.clone());
        *self.patches.lock().unwrap() += 1;
        Ok(updated)
    }
}

fn run(statuses: &[Status], end: &str) -> OutputDocument {
    let mut doc = OutputDocument::new();
    doc.assertions.push(AssertionResult {
        name: "web".into(),
        results: statuses
            .iter()
            .map(|status| {
                let mut record = ResultRecord::default();
                record.spec.insert("type".into(), json!("http"));
                record.data.insert("endTimestamp".into(), json!(end));
                record.status = Some(*status);
                record
            })
            .collect(),
    });
    doc
}

#[tokio::test]
async fn test_second_run_patches_existing_report() {
    let store = InMemoryReports::default();

    let doc = run(&[Status::Pass, Status::Fail], "2024-01-02T03:04:05Z");
    let first = upsert_report(&store, "web", "default", &doc, None, 1000)
        .await
        .unwrap();
    assert_eq!(first, UpsertOutcome::Created);

    let doc = run(&[Status::Pass], "2024-01-02T03:09:05Z");
    let second = upsert_report(&store, "web", "default", &doc, None, 1000)
        .await
        .unwrap();
    assert_eq!(second, UpsertOutcome::Patched);

    assert_eq!(store.creates(), 1);
    assert_eq!(store.patches(), 1);

    let report = store.get("default", "web").unwrap();
    // Summary reflects only the latest run
    assert_eq!(report.data["summary"], json!({"pass": 1}));
    // Results accumulate across runs
    assert_eq!(report.data["results"].as_array().unwrap().len(), 3);
    assert_eq!(report.labels()[ENGINE_LABEL], ENGINE);
    assert_eq!(report.data["scope"]["name"], "default");
}

#[tokio::test]
async fn test_results_capped_to_most_recent() {
    let store = InMemoryReports::default();

    let doc = run(&[Status::Fail; 3], "2024-01-02T03:04:05Z");
    upsert_report(&store, "web", "default", &doc, None, 4)
        .await
        .unwrap();
    let doc = run(&[Status::Pass; 2], "2024-01-02T03:09:05Z");
    upsert_report(&store, "web", "default", &doc, None, 4)
        .await
        .unwrap();

    let report = store.get("default", "web").unwrap();
    let results = report.data["results"].as_array().unwrap();
    assert_eq!(results.len(), 4);
    assert_eq!(results[0]["result"], "fail");
    assert_eq!(results[2]["result"], "pass");
    assert_eq!(results[3]["result"], "pass");
}

#[tokio::test]
async fn test_stale_write_is_retried() {
    let store = InMemoryReports::default();
    let doc = run(&[Status::Pass], "2024-01-02T03:04:05Z");
    upsert_report(&store, "web", "default", &doc, None, 1000)
        .await
        .unwrap();

    *store.stale_patches.lock().unwrap() = 2;
    let doc = run(&[Status::Error], "2024-01-02T03:09:05Z");
    let outcome = upsert_report(&store, "web", "default", &doc, None, 1000)
        .await
        .unwrap();

    assert_eq!(outcome, UpsertOutcome::Patched);
    assert_eq!(store.patches(), 1);
    let report = store.get("default", "web").unwrap();
    assert_eq!(report.data["summary"], json!({"error": 1}));
}

#[tokio::test]
async fn test_reports_are_per_namespace() {
    let store = InMemoryReports::default();
    let doc = run(&[Status::Pass], "2024-01-02T03:04:05Z");

    upsert_report(&store, "web", "team-a", &doc, None, 1000).await.unwrap();
    let outcome = upsert_report(&store, "web", "team-b", &doc, None, 1000).await.unwrap();

    assert_eq!(outcome, UpsertOutcome::Created);
    assert_eq!(store.creates(), 2);
}

#[tokio::test]
async fn test_persistent_conflicts_give_up() {
    let store = InMemoryReports::default();
    let doc = run(&[Status::Pass], "2024-01-02T03:04:05Z");
    upsert_report(&store, "web", "default", &doc, None, 1000).await.unwrap();

    *store.stale_patches.lock().unwrap() = 100;
    let err = upsert_report(&store, "web", "default", &doc, None, 1000)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::ConflictRetriesExhausted { attempts: 5, .. }));
    assert!(!err.is_permanent());
}
