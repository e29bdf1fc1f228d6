//! Kubernetes Events on NetworkAssertions
//!
//! Visible with `kubectl describe networkassertion/<name>`.

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};

use super::workload::FIELD_MANAGER;
use crate::models::NetworkAssertion;

pub const REASON_JOB_CREATED: &str = "JobCreated";
pub const REASON_CRON_JOB_CREATED: &str = "CronJobCreated";
pub const REASON_REPORT_CREATED: &str = "PolicyReportCreated";
pub const REASON_REPORT_UPDATED: &str = "PolicyReportUpdated";
pub const REASON_PROBE_FAILED: &str = "ProbePodFailed";

#[derive(Clone)]
pub struct EventPublisher {
    recorder: Recorder,
}

impl EventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn info(&self, assertion: &NetworkAssertion, reason: &str, note: String) {
        self.publish(assertion, EventType::Normal, reason, note).await;
    }

    pub async fn warning(&self, assertion: &NetworkAssertion, reason: &str, note: String) {
        self.publish(assertion, EventType::Warning, reason, note).await;
    }

    /// Failures are logged; an Event is never worth failing a handler over
    async fn publish(&self, assertion: &NetworkAssertion, type_: EventType, reason: &str, note: String) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        let reference = assertion.object_ref(&());
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            tracing::warn!(
                assertion = %assertion.name_any(),
                reason,
                "Failed to publish event: {}",
                e
            );
        }
    }
}
