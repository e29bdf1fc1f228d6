//! Operator module
//!
//! Watches NetworkAssertions and probe pods. Assertion events are handled in
//! one task per event, serialised per object through [`LockTable`]; probe
//! pods are handed to the [`PodMonitor`].

pub mod error;
pub mod events;
pub mod metrics;
pub mod pod_monitor;
pub mod reconciler;
pub mod report;
pub mod state;
pub mod workload;

pub use error::{Error, Result};
pub use events::EventPublisher;
pub use metrics::{MetricsRecorder, NoopMetrics, TracingMetrics};
pub use pod_monitor::PodMonitor;
pub use reconciler::{Change, Reconciler, classify, validate_spec};
pub use report::{KubeReportStore, ReportStore, UpsertOutcome, upsert_report};
pub use state::{LockTable, MonitorRegistry, object_key};

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio::task::JoinHandle;

use crate::config::Settings;
use crate::models::NetworkAssertion;

/// Handler attempts before a transient failure is given up on
pub const MAX_ATTEMPTS: u32 = 8;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Delay before retrying after failed attempt number `attempt` (1-based)
pub fn backoff_delay(attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    INITIAL_BACKOFF.saturating_mul(factor).min(MAX_BACKOFF)
}

/// The controller process
pub struct Operator {
    client: Client,
    namespace: Option<String>,
    reconciler: Arc<Reconciler>,
    monitor: PodMonitor,
    locks: LockTable,
}

impl Operator {
    /// Wire up the operator. `namespace` limits both watches; `None`
    /// watches the whole cluster.
    pub fn new(
        client: Client,
        settings: Arc<Settings>,
        namespace: Option<String>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let events = EventPublisher::new(client.clone());
        let store: Arc<dyn ReportStore> = Arc::new(KubeReportStore::new(client.clone()));
        let reconciler = Reconciler::new(
            client.clone(),
            settings.clone(),
            events.clone(),
            metrics.clone(),
        );
        let monitor = PodMonitor::new(client.clone(), store, settings, events, metrics);

        Self {
            client,
            namespace,
            reconciler: Arc::new(reconciler),
            monitor,
            locks: LockTable::new(),
        }
    }

    /// Run both watch loops until one of them stops
    pub async fn run(self) -> anyhow::Result<()> {
        match &self.namespace {
            Some(ns) => tracing::info!(namespace = %ns, "Starting netchecks operator"),
            None => tracing::info!("Starting netchecks operator for all namespaces"),
        }

        let assertions = self.watch_assertions();
        let pods = self.watch_probe_pods();

        tokio::select! {
            res = assertions => res?,
            res = pods => res?,
        }
        anyhow::bail!("watch loop stopped after {} consecutive errors", MAX_CONSECUTIVE_ERRORS)
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn watch_assertions(&self) -> JoinHandle<()> {
        let api: Api<NetworkAssertion> = self.api();
        let client = self.client.clone();
        let reconciler = self.reconciler.clone();
        let locks = self.locks.clone();

        tokio::spawn(async move {
            let mut w = Box::pin(watcher(api, watcher::Config::default()));
            let mut error_count = 0u32;

            while let Some(event) = w.next().await {
                match event {
                    Ok(watcher::Event::InitApply(obj)) => {
                        error_count = 0;
                        dispatch(&client, &reconciler, &locks, &obj, Dispatch::Apply { initial: true });
                    }
                    Ok(watcher::Event::Apply(obj)) => {
                        error_count = 0;
                        dispatch(&client, &reconciler, &locks, &obj, Dispatch::Apply { initial: false });
                    }
                    Ok(watcher::Event::Delete(obj)) => {
                        error_count = 0;
                        dispatch(&client, &reconciler, &locks, &obj, Dispatch::Delete);
                    }
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {
                        error_count = 0;
                    }
                    Err(e) => {
                        error_count += 1;
                        if error_count == 1 || error_count.is_multiple_of(10) {
                            tracing::warn!("NetworkAssertion watcher error ({}): {}", error_count, e);
                        }
                        // Most likely the CRD is not installed
                        if error_count >= MAX_CONSECUTIVE_ERRORS {
                            tracing::error!(
                                "NetworkAssertion watcher stopped after {} consecutive errors",
                                error_count
                            );
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }

    fn watch_probe_pods(&self) -> JoinHandle<()> {
        let api: Api<Pod> = self.api();
        let monitor = self.monitor.clone();
        let selector = workload::probe_pod_selector();

        tokio::spawn(async move {
            let config = watcher::Config::default().labels(&selector);
            let mut w = Box::pin(watcher(api, config));
            let mut error_count = 0u32;

            while let Some(event) = w.next().await {
                match event {
                    Ok(watcher::Event::InitApply(pod)) | Ok(watcher::Event::Apply(pod)) => {
                        error_count = 0;
                        monitor.start(&pod);
                    }
                    Ok(watcher::Event::Delete(pod)) => {
                        error_count = 0;
                        tracing::debug!(pod = %pod.name_any(), "Probe pod deleted");
                    }
                    Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => {
                        error_count = 0;
                    }
                    Err(e) => {
                        error_count += 1;
                        if error_count == 1 || error_count.is_multiple_of(10) {
                            tracing::warn!("Probe pod watcher error ({}): {}", error_count, e);
                        }
                        if error_count >= MAX_CONSECUTIVE_ERRORS {
                            tracing::error!(
                                "Probe pod watcher stopped after {} consecutive errors",
                                error_count
                            );
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Dispatch {
    Apply { initial: bool },
    Delete,
}

/// Handle one watch event in its own task, holding the object's lock
fn dispatch(
    client: &Client,
    reconciler: &Arc<Reconciler>,
    locks: &LockTable,
    assertion: &NetworkAssertion,
    kind: Dispatch,
) {
    let namespace = assertion.namespace().unwrap_or_default();
    let key = object_key(&namespace, &assertion.name_any());
    let client = client.clone();
    let reconciler = reconciler.clone();
    let locks = locks.clone();
    let assertion = assertion.clone();

    tokio::spawn(async move {
        let guard = locks.lock(&key).await;
        match kind {
            Dispatch::Apply { initial } => {
                let api: Api<NetworkAssertion> = Api::namespaced(client, &namespace);
                reconcile_with_retry(&reconciler, &api, &assertion.name_any(), initial).await;
            }
            Dispatch::Delete => reconciler.on_delete(&assertion),
        }
        drop(guard);
        locks.remove(&key);
    });
}

/// Run the handler for the current state of `name`, retrying transient
/// failures with exponential backoff.
///
/// The object is re-read on every attempt: by the time the lock is held an
/// earlier handler may already have recorded the spec as handled.
async fn reconcile_with_retry(
    reconciler: &Reconciler,
    api: &Api<NetworkAssertion>,
    name: &str,
    initial: bool,
) {
    for attempt in 1..=MAX_ATTEMPTS {
        let assertion = match api.get_opt(name).await {
            Ok(Some(assertion)) => assertion,
            Ok(None) => {
                tracing::debug!(assertion = name, "NetworkAssertion is gone");
                return;
            }
            Err(e) => {
                tracing::warn!(assertion = name, attempt, "Failed to read NetworkAssertion: {}", e);
                tokio::time::sleep(backoff_delay(attempt)).await;
                continue;
            }
        };

        let change = classify(&assertion, initial);
        match reconciler.handle(&assertion, &change).await {
            Ok(()) => return,
            Err(e) if e.is_permanent() => {
                tracing::error!(assertion = name, "Permanent error, not retrying: {}", e);
                reconciler
                    .events()
                    .warning(&assertion, e.reason(), e.to_string())
                    .await;
                return;
            }
            Err(e) => {
                let delay = backoff_delay(attempt);
                tracing::warn!(
                    assertion = name,
                    attempt,
                    "Handler failed, retrying in {:?}: {}",
                    delay,
                    e
                );
                if attempt < MAX_ATTEMPTS {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    tracing::error!(assertion = name, "Giving up after {} attempts", MAX_ATTEMPTS);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_one_second() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(3), Duration::from_secs(4));
        assert_eq!(backoff_delay(8), Duration::from_secs(128));
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(10), Duration::from_secs(300));
        assert_eq!(backoff_delay(40), Duration::from_secs(300));
    }
}
