//! Report aggregator
//!
//! Converts a probe output document into PolicyReport entries and writes
//! them to the one PolicyReport per NetworkAssertion.
//!
//! The upsert is a read-modify-write guarded by `metadata.resourceVersion`:
//! a concurrent writer makes the patch fail with 409 and the whole cycle is
//! retried against the fresh object.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::core::ApiResource;
use kube::{Api, Client, ResourceExt};
use serde_json::{Value, json};

use super::error::{Error, Result, is_conflict};
use super::workload::{LABEL_INSTANCE, common_labels};
use crate::models::output::{OutputDocument, parse_timestamp};
use crate::models::policy_report::{
    K8sTimestamp, PolicyReportEntry, PolicyReportSummary, REPORT_SOURCE,
    policy_report_api_resource,
};
use crate::runner;

pub const ENGINE_LABEL: &str = "policy.kubernetes.io/engine";
pub const ENGINE: &str = "netcheck";

/// Attempts at the read-modify-write cycle before giving up
pub const MAX_UPSERT_ATTEMPTS: u32 = 5;

/// Convert an ISO 8601 timestamp to whole seconds
pub fn to_k8s_timestamp(iso: &str) -> Option<K8sTimestamp> {
    parse_timestamp(iso).map(|ts| K8sTimestamp {
        seconds: ts.timestamp(),
        nanos: 0,
    })
}

/// One entry per result record, in document order
pub fn convert_results(doc: &OutputDocument) -> Vec<PolicyReportEntry> {
    let mut entries = Vec::new();
    for assertion in &doc.assertions {
        for (i, result) in assertion.results.iter().enumerate() {
            let timestamp = result
                .end_timestamp()
                .and_then(to_k8s_timestamp)
                .unwrap_or_else(|| K8sTimestamp {
                    seconds: chrono::Utc::now().timestamp(),
                    nanos: 0,
                });

            let properties = BTreeMap::from([
                ("spec".to_string(), Value::Object(result.spec.clone()).to_string()),
                ("data".to_string(), Value::Object(result.data.clone()).to_string()),
            ]);

            entries.push(PolicyReportEntry {
                source: REPORT_SOURCE.to_string(),
                policy: assertion.name.clone(),
                rule: result
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("{}-rule-{}", assertion.name, i + 1)),
                category: result.probe_type().unwrap_or_default().to_string(),
                timestamp,
                result: result
                    .status
                    .map(|s| s.as_str())
                    .unwrap_or("skip")
                    .to_string(),
                message: result
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("Rule from {}", assertion.name)),
                properties,
            });
        }
    }
    entries
}

/// Count results by status; a missing status counts as skip
pub fn summarize(doc: &OutputDocument) -> PolicyReportSummary {
    let mut summary = PolicyReportSummary::default();
    for (_, result) in doc.results() {
        summary.record(result.status.map(|s| s.as_str()).unwrap_or("skip"));
    }
    summary
}

/// Redact sensitive fields in every result
pub fn redact_output(doc: &mut OutputDocument) {
    for assertion in &mut doc.assertions {
        for result in &mut assertion.results {
            runner::redact(result);
        }
    }
}

pub fn report_labels(assertion: &str) -> BTreeMap<String, String> {
    let mut labels = common_labels(assertion);
    labels.insert(ENGINE_LABEL.to_string(), ENGINE.to_string());
    labels
}

pub fn report_annotations() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("category".to_string(), "Network".to_string()),
        ("created-by".to_string(), "netcheck".to_string()),
        (
            "netcheck-operator-version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ])
}

fn scope(namespace: &str) -> Value {
    json!({"kind": "Namespace", "name": namespace, "apiGroup": "v1"})
}

/// Keep the most recent `max` results
pub fn merge_results(previous: Vec<Value>, new: &[PolicyReportEntry], max: usize) -> Vec<Value> {
    let mut results = previous;
    results.extend(new.iter().filter_map(|entry| serde_json::to_value(entry).ok()));
    if results.len() > max {
        results.drain(..results.len() - max);
    }
    results
}

/// A fresh PolicyReport for the first probe run of an assertion
pub fn build_report(
    assertion: &str,
    namespace: &str,
    entries: &[PolicyReportEntry],
    summary: &PolicyReportSummary,
    owner: Option<&OwnerReference>,
    max_results: usize,
) -> DynamicObject {
    let mut report = DynamicObject::new(assertion, &policy_report_api_resource()).within(namespace);
    report.metadata.labels = Some(report_labels(assertion));
    report.metadata.annotations = Some(report_annotations());
    report.metadata.owner_references = owner.map(|o| vec![o.clone()]);
    report.data = json!({
        "scope": scope(namespace),
        "results": merge_results(Vec::new(), entries, max_results),
        "summary": summary,
    });
    report
}

/// Merge patch for an existing report
pub fn build_patch(
    existing: &DynamicObject,
    namespace: &str,
    entries: &[PolicyReportEntry],
    summary: &PolicyReportSummary,
    max_results: usize,
) -> Value {
    let assertion = existing.name_any();
    let previous = existing
        .data
        .get("results")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    json!({
        "metadata": {
            "resourceVersion": existing.resource_version(),
            "labels": report_labels(&assertion),
            "annotations": report_annotations(),
        },
        "scope": scope(namespace),
        "results": merge_results(previous, entries, max_results),
        "summary": summary.to_merge_patch(),
    })
}

/// PolicyReport persistence
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// The report belonging to `assertion`, if any
    async fn find(&self, namespace: &str, assertion: &str) -> Result<Option<DynamicObject>>;

    /// Create a report; [`Error::Conflict`] when it already exists
    async fn create(&self, namespace: &str, report: &DynamicObject) -> Result<DynamicObject>;

    /// Merge-patch a report; [`Error::Conflict`] on a stale resourceVersion
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject>;
}

/// PolicyReports stored in the cluster
#[derive(Clone)]
pub struct KubeReportStore {
    client: Client,
    resource: ApiResource,
}

impl KubeReportStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            resource: policy_report_api_resource(),
        }
    }

    fn api(&self, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &self.resource)
    }
}

fn conflict_as(name: &str, error: kube::Error) -> Error {
    if is_conflict(&error) {
        Error::Conflict {
            name: name.to_string(),
        }
    } else {
        Error::Kube(error)
    }
}

#[async_trait]
impl ReportStore for KubeReportStore {
    async fn find(&self, namespace: &str, assertion: &str) -> Result<Option<DynamicObject>> {
        let selector = format!("{LABEL_INSTANCE}={assertion}");
        let reports = self
            .api(namespace)
            .list(&ListParams::default().labels(&selector))
            .await?;

        let mut items = reports.items;
        let position = items
            .iter()
            .position(|report| report.name_any() == assertion)
            .unwrap_or(0);
        Ok((!items.is_empty()).then(|| items.swap_remove(position)))
    }

    async fn create(&self, namespace: &str, report: &DynamicObject) -> Result<DynamicObject> {
        let name = report.name_any();
        self.api(namespace)
            .create(&PostParams::default(), report)
            .await
            .map_err(|e| conflict_as(&name, e))
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<DynamicObject> {
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| conflict_as(name, e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Patched,
}

/// Create or update the PolicyReport for `assertion` with the results in `doc`
pub async fn upsert_report(
    store: &dyn ReportStore,
    assertion: &str,
    namespace: &str,
    doc: &OutputDocument,
    owner: Option<&OwnerReference>,
    max_results: usize,
) -> Result<UpsertOutcome> {
    let entries = convert_results(doc);
    let summary = summarize(doc);

    for attempt in 1..=MAX_UPSERT_ATTEMPTS {
        let outcome = match store.find(namespace, assertion).await? {
            None => {
                tracing::info!(assertion, namespace, "Creating new PolicyReport");
                let report =
                    build_report(assertion, namespace, &entries, &summary, owner, max_results);
                store
                    .create(namespace, &report)
                    .await
                    .map(|_| UpsertOutcome::Created)
            }
            Some(existing) => {
                tracing::info!(assertion, namespace, "Updating existing PolicyReport");
                let patch = build_patch(&existing, namespace, &entries, &summary, max_results);
                store
                    .patch(namespace, &existing.name_any(), &patch)
                    .await
                    .map(|_| UpsertOutcome::Patched)
            }
        };

        match outcome {
            Err(Error::Conflict { .. }) => {
                tracing::debug!(assertion, namespace, attempt, "PolicyReport write conflicted, retrying");
            }
            other => return other,
        }
    }

    Err(Error::ConflictRetriesExhausted {
        name: assertion.to_string(),
        attempts: MAX_UPSERT_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::output::{AssertionResult, ResultRecord, Status};
    use mockall::Sequence;

    fn record(status: Option<Status>, end: &str) -> ResultRecord {
        let mut record = ResultRecord::default();
        record.spec.insert("type".into(), json!("http"));
        record
            .spec
            .insert("headers".into(), json!({"Authorization": "Bearer t"}));
        record.data.insert("endTimestamp".into(), json!(end));
        record.status = status;
        record
    }

    fn document() -> OutputDocument {
        let mut doc = OutputDocument::new();
        doc.assertions.push(AssertionResult {
            name: "web".into(),
            results: vec![
                record(Some(Status::Pass), "2024-01-02T03:04:05Z"),
                record(None, "2024-01-02T03:04:06.123456"),
            ],
        });
        doc
    }

    fn existing_report(rv: &str) -> DynamicObject {
        let mut report = build_report(
            "web",
            "default",
            &[],
            &PolicyReportSummary::default(),
            None,
            10,
        );
        report.metadata.resource_version = Some(rv.to_string());
        report
    }

    #[test]
    fn test_convert_results() {
        let entries = convert_results(&document());
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].rule, "web-rule-1");
        assert_eq!(entries[0].result, "pass");
        assert_eq!(entries[0].category, "http");
        assert_eq!(entries[0].message, "Rule from web");
        assert_eq!(entries[0].timestamp.seconds, 1704164645);
        assert_eq!(entries[1].result, "skip");
        assert_eq!(entries[1].timestamp.seconds, 1704164646);

        let spec: Value = serde_json::from_str(&entries[0].properties["spec"]).unwrap();
        assert_eq!(spec["type"], "http");
    }

    #[test]
    fn test_summarize() {
        let summary = summarize(&document());
        assert_eq!(summary.pass, Some(1));
        assert_eq!(summary.skip, Some(1));
        assert_eq!(summary.fail, None);
    }

    #[test]
    fn test_redact_output() {
        let mut doc = document();
        redact_output(&mut doc);
        assert!(doc.results().all(|(_, r)| r.spec["headers"] == "REDACTED"));
    }

    #[test]
    fn test_merge_results_keeps_most_recent() {
        let previous: Vec<Value> = (0..4).map(|i| json!({"rule": format!("old-{i}")})).collect();
        let entries = convert_results(&document());
        let merged = merge_results(previous, &entries, 3);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0]["rule"], "old-3");
        assert_eq!(merged[2]["rule"], "web-rule-2");
    }

    #[test]
    fn test_patch_carries_resource_version() {
        let patch = build_patch(
            &existing_report("42"),
            "default",
            &convert_results(&document()),
            &summarize(&document()),
            10,
        );
        assert_eq!(patch["metadata"]["resourceVersion"], "42");
        assert_eq!(patch["summary"]["fail"], Value::Null);
        assert_eq!(patch["results"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_conflict_retries_then_succeeds() {
        let mut store = MockReportStore::new();
        let mut seq = Sequence::new();

        store
            .expect_find()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(existing_report("1"))));
        store
            .expect_patch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name, _| {
                Err(Error::Conflict {
                    name: name.to_string(),
                })
            });
        store
            .expect_find()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(Some(existing_report("2"))));
        store
            .expect_patch()
            .withf(|_, _, patch| patch["metadata"]["resourceVersion"] == "2")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(existing_report("3")));

        let outcome = upsert_report(&store, "web", "default", &document(), None, 10)
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Patched);
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        let mut store = MockReportStore::new();
        store
            .expect_find()
            .times(MAX_UPSERT_ATTEMPTS as usize)
            .returning(|_, _| Ok(None));
        store
            .expect_create()
            .times(MAX_UPSERT_ATTEMPTS as usize)
            .returning(|_, report| {
                Err(Error::Conflict {
                    name: report.name_any(),
                })
            });

        let err = upsert_report(&store, "web", "default", &document(), None, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConflictRetriesExhausted { attempts: 5, .. }));
    }
}
