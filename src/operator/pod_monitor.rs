//! Pod monitor
//!
//! Follows each probe pod until it finishes, then turns its output into
//! PolicyReport results. A processed pod is marked with an annotation so a
//! restarted operator does not report the same run twice.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::core::v1::Pod;
use kube::api::{LogParams, Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use rand::Rng;
use serde_json::json;

use super::error::{Error, Result};
use super::events::{
    EventPublisher, REASON_PROBE_FAILED, REASON_REPORT_CREATED, REASON_REPORT_UPDATED,
};
use super::metrics::MetricsRecorder;
use super::report::{ReportStore, UpsertOutcome, redact_output, summarize, upsert_report};
use super::state::{MonitorRegistry, object_key};
use super::workload::{LABEL_INSTANCE, PROBE_CONTAINER};
use crate::config::Settings;
use crate::models::{NetworkAssertion, OutputDocument};

/// Set on a probe pod once its results are in the PolicyReport
pub const PROCESSED_ANNOTATION: &str = "netchecks.io/report-processed";

/// Log prefix returned when the kubelet has no logs for the container
pub const LOG_UNAVAILABLE: &str = "unable to retrieve container logs";

const PENDING_POLL: Duration = Duration::from_secs(5);
const RUNNING_POLL: Duration = Duration::from_secs(1);
const MAX_JITTER_MS: u64 = 2000;

/// What to do after observing a pod phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStep {
    Wait(Duration),
    Process,
    Stop,
}

pub fn next_step(phase: Option<&str>) -> MonitorStep {
    match phase {
        Some("Pending") => MonitorStep::Wait(PENDING_POLL),
        Some("Succeeded") => MonitorStep::Process,
        Some("Failed") => MonitorStep::Stop,
        _ => MonitorStep::Wait(RUNNING_POLL),
    }
}

pub fn is_processed(pod: &Pod) -> bool {
    pod.annotations().contains_key(PROCESSED_ANNOTATION)
}

/// Parse the output document from a probe log.
///
/// Returns `Ok(None)` for the kubelet's "no logs" message. Stray lines before
/// the document (stderr shares the log stream) are skipped.
pub fn parse_probe_output(pod: &str, log: &str) -> Result<Option<OutputDocument>> {
    if log.starts_with(LOG_UNAVAILABLE) {
        return Ok(None);
    }

    let start = document_start(log).unwrap_or(0);
    let mut stream = serde_json::Deserializer::from_str(&log[start..]).into_iter::<OutputDocument>();
    match stream.next() {
        Some(Ok(doc)) => Ok(Some(doc)),
        Some(Err(source)) => Err(Error::InvalidProbeOutput {
            pod: pod.to_string(),
            source,
        }),
        None => Err(Error::InvalidProbeOutput {
            pod: pod.to_string(),
            source: serde::de::Error::custom("probe log is empty"),
        }),
    }
}

/// Event note for a probe pod that ended in the `Failed` phase
pub fn failed_pod_note(pod: &Pod) -> String {
    let status = pod.status.as_ref();
    let detail = status
        .and_then(|s| s.message.as_deref().or(s.reason.as_deref()))
        .or_else(|| {
            status
                .and_then(|s| s.container_statuses.as_ref())
                .into_iter()
                .flatten()
                .filter_map(|c| c.state.as_ref()?.terminated.as_ref())
                .find_map(|t| t.reason.as_deref())
        });
    match detail {
        Some(detail) => format!("Probe pod '{}' failed: {}", pod.name_any(), detail),
        None => format!("Probe pod '{}' failed.", pod.name_any()),
    }
}

/// Warning Event for an error that stops a probe run from being reported.
/// Transient errors get none; the next monitor pass may still succeed.
pub fn output_warning(error: &Error) -> Option<(&'static str, String)> {
    error
        .is_permanent()
        .then(|| (error.reason(), error.to_string()))
}

fn document_start(log: &str) -> Option<usize> {
    let mut offset = 0;
    for line in log.split_inclusive('\n') {
        if line.trim_start().starts_with('{') {
            return Some(offset + (line.len() - line.trim_start().len()));
        }
        offset += line.len();
    }
    None
}

/// Watches probe pods and reports their results
#[derive(Clone)]
pub struct PodMonitor {
    client: Client,
    store: Arc<dyn ReportStore>,
    settings: Arc<Settings>,
    events: EventPublisher,
    metrics: Arc<dyn MetricsRecorder>,
    active: MonitorRegistry,
}

impl PodMonitor {
    pub fn new(
        client: Client,
        store: Arc<dyn ReportStore>,
        settings: Arc<Settings>,
        events: EventPublisher,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            client,
            store,
            settings,
            events,
            metrics,
            active: MonitorRegistry::new(),
        }
    }

    /// Start a monitor task for `pod` unless it is processed or already
    /// monitored
    pub fn start(&self, pod: &Pod) {
        if is_processed(pod) {
            return;
        }
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let Some(guard) = self.active.track(&object_key(&namespace, &name)) else {
            return;
        };

        let monitor = self.clone();
        tokio::spawn(async move {
            let _guard = guard;
            tracing::info!(namespace = %namespace, pod = %name, "Monitoring pod");
            if let Err(e) = monitor.monitor(&namespace, &name).await {
                tracing::error!(namespace = %namespace, pod = %name, "Pod monitoring failed: {}", e);
            }
            tracing::info!(namespace = %namespace, pod = %name, "Pod monitoring complete");
        });
    }

    async fn monitor(&self, namespace: &str, name: &str) -> Result<()> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);

        loop {
            let Some(pod) = pods.get_opt(name).await? else {
                tracing::info!(namespace, pod = name, "Pod no longer exists");
                return Ok(());
            };
            if is_processed(&pod) {
                return Ok(());
            }

            let phase = pod.status.as_ref().and_then(|s| s.phase.clone());
            match next_step(phase.as_deref()) {
                MonitorStep::Wait(delay) => {
                    tracing::debug!(namespace, pod = name, ?phase, "Waiting for pod");
                    tokio::time::sleep(delay).await;
                }
                MonitorStep::Stop => {
                    tracing::warn!(namespace, pod = name, "Probe pod failed");
                    let assertion = self.owning_assertion(&pod, namespace).await?;
                    if let Some(assertion) = &assertion {
                        self.events
                            .warning(assertion, REASON_PROBE_FAILED, failed_pod_note(&pod))
                            .await;
                    }
                    return mark_processed(&pods, name).await;
                }
                MonitorStep::Process => {
                    tracing::info!(namespace, pod = name, "Probe Pod has completed");
                    let jitter = rand::thread_rng().gen_range(0..=MAX_JITTER_MS);
                    tokio::time::sleep(Duration::from_millis(jitter)).await;
                    return self.process(&pods, namespace, name).await;
                }
            }
        }
    }

    async fn process(&self, pods: &Api<Pod>, namespace: &str, name: &str) -> Result<()> {
        let started = Instant::now();

        // Another monitor may have finished the pod during the jitter
        let Some(pod) = pods.get_opt(name).await? else {
            return Ok(());
        };
        if is_processed(&pod) {
            return Ok(());
        }
        let Some(assertion_name) = pod.labels().get(LABEL_INSTANCE).cloned() else {
            tracing::warn!(namespace, pod = name, "Probe pod has no {} label", LABEL_INSTANCE);
            return Ok(());
        };
        let assertion = self.owning_assertion(&pod, namespace).await?;

        let params = LogParams {
            container: Some(PROBE_CONTAINER.to_string()),
            ..Default::default()
        };
        let log = pods.logs(name, &params).await?;
        tracing::debug!(namespace, pod = name, "Retrieved probe Pod's log");

        let parsed = match parse_probe_output(name, &log) {
            Ok(parsed) => parsed,
            Err(e) => {
                if let (Some(assertion), Some((reason, note))) = (&assertion, output_warning(&e)) {
                    self.events.warning(assertion, reason, note).await;
                }
                // Report each broken log once
                mark_processed(pods, name).await?;
                return Err(e);
            }
        };
        let Some(mut doc) = parsed else {
            tracing::warn!(namespace, pod = name, "Unable to retrieve container logs.");
            return Ok(());
        };

        let disable_redaction = assertion
            .as_ref()
            .is_some_and(|a| a.spec.disable_redaction);
        if !disable_redaction {
            redact_output(&mut doc);
        }
        let owner = assertion.as_ref().and_then(|a| a.controller_owner_ref(&()));

        let outcome = upsert_report(
            self.store.as_ref(),
            &assertion_name,
            namespace,
            &doc,
            owner.as_ref(),
            self.settings.policy_report_max_results,
        )
        .await?;

        self.record_metrics(&assertion_name, &doc);

        if let Some(assertion) = &assertion {
            let results = doc.results().count();
            let (reason, verb) = match outcome {
                UpsertOutcome::Created => (REASON_REPORT_CREATED, "created"),
                UpsertOutcome::Patched => (REASON_REPORT_UPDATED, "updated"),
            };
            self.events
                .info(
                    assertion,
                    reason,
                    format!("PolicyReport '{assertion_name}' {verb} with {results} results from pod '{name}'."),
                )
                .await;
        }

        mark_processed(pods, name).await?;

        self.metrics
            .handler_duration(&assertion_name, "results", started.elapsed());
        Ok(())
    }

    /// NetworkAssertion named by the pod's instance label, if it still exists
    async fn owning_assertion(&self, pod: &Pod, namespace: &str) -> Result<Option<NetworkAssertion>> {
        let Some(assertion_name) = pod.labels().get(LABEL_INSTANCE) else {
            return Ok(None);
        };
        let assertions: Api<NetworkAssertion> = Api::namespaced(self.client.clone(), namespace);
        Ok(assertions.get_opt(assertion_name).await?)
    }

    fn record_metrics(&self, assertion: &str, doc: &OutputDocument) {
        for (_, result) in doc.results() {
            if let (Some(probe_type), Some(seconds)) = (result.probe_type(), result.duration_secs()) {
                self.metrics.probe_duration(assertion, probe_type, seconds);
            }
        }

        let summary = summarize(doc);
        for (status, count) in [
            ("pass", summary.pass),
            ("fail", summary.fail),
            ("warn", summary.warn),
            ("error", summary.error),
            ("skip", summary.skip),
        ] {
            if let Some(count) = count {
                self.metrics.results_processed(assertion, status, count);
            }
        }
    }
}

async fn mark_processed(pods: &Api<Pod>, name: &str) -> Result<()> {
    let mark = json!({
        "metadata": {
            "annotations": { PROCESSED_ANNOTATION: chrono::Utc::now().to_rfc3339() }
        }
    });
    pods.patch(name, &PatchParams::default(), &Patch::Merge(&mark))
        .await?;
    Ok(())
}
