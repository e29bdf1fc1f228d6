//! NetworkAssertion reconciler
//!
//! Create builds the probe workload (ConfigMap plus Job or CronJob). Resume
//! runs the create path too, so a restarted operator rebuilds anything
//! removed while it was down. Update tears the old workload down and runs the
//! create path again. Delete only logs; owner references clean up derived
//! objects.

use std::sync::Arc;
use std::time::Instant;

use kube::api::{Patch, PatchParams};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::{Value, json};

use super::error::{Error, Result};
use super::events::{EventPublisher, REASON_CRON_JOB_CREATED, REASON_JOB_CREATED};
use super::metrics::MetricsRecorder;
use super::workload::{
    WorkloadManager, adopt, build_config_map, build_cron_job, build_cron_job_spec, build_job,
    build_job_spec,
};
use crate::config::Settings;
use crate::models::{CreationStatus, NetworkAssertion, NetworkAssertionSpec, RuleType};
use crate::validation::check_syntax;

/// Annotation holding the spec the operator last acted on, as JSON
pub const LAST_HANDLED_ANNOTATION: &str = "netchecks.io/last-handled-spec";

/// Context names that would shadow the result record in validation rules
const RESERVED_CONTEXT_NAMES: &[&str] = &["spec", "data"];

/// What a watch event means for a NetworkAssertion
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Create,
    Resume,
    Update { old: NetworkAssertionSpec },
    Unchanged,
}

/// Classify a watch event by comparing the object's spec with the last
/// handled one. `initial` is set for objects from the initial listing.
pub fn classify(assertion: &NetworkAssertion, initial: bool) -> Change {
    let Some(raw) = assertion.annotations().get(LAST_HANDLED_ANNOTATION) else {
        return Change::Create;
    };

    let old: NetworkAssertionSpec = match serde_json::from_str(raw) {
        Ok(old) => old,
        Err(e) => {
            tracing::warn!(
                assertion = %assertion.name_any(),
                "Ignoring unreadable {} annotation: {}",
                LAST_HANDLED_ANNOTATION,
                e
            );
            return Change::Create;
        }
    };

    let unchanged = serde_json::to_value(&old).ok() == serde_json::to_value(&assertion.spec).ok();
    match (unchanged, initial) {
        (true, true) => Change::Resume,
        (true, false) => Change::Unchanged,
        (false, _) => Change::Update { old },
    }
}

/// Reject specs that can never produce a working probe
pub fn validate_spec(spec: &NetworkAssertionSpec) -> Result<()> {
    if spec.rules.is_empty() {
        return Err(Error::InvalidAssertion("Rules must be set.".to_string()));
    }

    for (i, rule) in spec.rules.iter().enumerate() {
        let label = rule
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", i + 1));
        if rule.rule_type().is_none() {
            return Err(Error::InvalidAssertion(format!(
                "rule {} has unsupported type '{}'; expected one of {}, {}, {}",
                label,
                rule.type_name().unwrap_or_default(),
                RuleType::Dns.as_str(),
                RuleType::Http.as_str(),
                RuleType::Internal.as_str(),
            )));
        }
        if let Some(expression) = rule.validation() {
            check_syntax(expression)?;
        }
    }

    for context in &spec.context {
        if RESERVED_CONTEXT_NAMES.contains(&context.name.as_str()) {
            return Err(Error::InvalidAssertion(format!(
                "context name '{}' is reserved",
                context.name
            )));
        }
        if context.config_map.is_none() && context.secret.is_none() && context.inline.is_none() {
            return Err(Error::InvalidAssertion(format!(
                "context '{}' needs one of configMap, secret or inline",
                context.name
            )));
        }
    }

    Ok(())
}

pub struct Reconciler {
    client: Client,
    workloads: WorkloadManager,
    settings: Arc<Settings>,
    events: EventPublisher,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Reconciler {
    pub fn new(
        client: Client,
        settings: Arc<Settings>,
        events: EventPublisher,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            workloads: WorkloadManager::new(client.clone()),
            client,
            settings,
            events,
            metrics,
        }
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Run the handler for `change`
    pub async fn handle(&self, assertion: &NetworkAssertion, change: &Change) -> Result<()> {
        match change {
            Change::Create => self.on_create(assertion).await.map(|_| ()),
            Change::Update { old } => self.on_update(assertion, old).await,
            Change::Resume => self.on_resume(assertion).await.map(|_| ()),
            Change::Unchanged => Ok(()),
        }
    }

    pub async fn on_create(&self, assertion: &NetworkAssertion) -> Result<CreationStatus> {
        let started = Instant::now();
        let name = assertion.name_any();
        let namespace = assertion.namespace().unwrap_or_default();
        let spec = &assertion.spec;

        tracing::info!(assertion = %name, namespace = %namespace, "NetworkAssertion on-create handler called");
        self.metrics.assertion_seen(&namespace, &name);

        validate_spec(spec)?;
        tracing::info!(assertion = %name, "Rules loaded from NetworkAssertion: {}", spec.rules.len());

        let owner = assertion
            .controller_owner_ref(&())
            .ok_or_else(|| Error::MissingField {
                kind: "NetworkAssertion",
                name: name.clone(),
                field: "metadata.uid",
            })?;

        let mut config_map = build_config_map(&name, &spec.rules, &spec.context)?;
        adopt(&mut config_map.metadata, &owner);
        let config_map = self.workloads.apply_config_map(&namespace, &config_map).await?;
        let config_map_name = config_map.name_any();

        let job_spec = build_job_spec(
            &name,
            &config_map_name,
            &spec.context,
            &self.settings,
            spec.template.as_ref(),
            spec.disable_redaction,
        )?;
        let job = build_job(&name, job_spec);

        let created = match &spec.schedule {
            Some(schedule) => {
                tracing::info!(assertion = %name, schedule = %schedule, "Schedule defined. Creating CronJob");
                let mut cron_job = build_cron_job(&name, build_cron_job_spec(schedule, &job));
                adopt(&mut cron_job.metadata, &owner);
                let cron_job = self.workloads.replace_cron_job(&namespace, &cron_job).await?;
                self.events
                    .info(
                        assertion,
                        REASON_CRON_JOB_CREATED,
                        format!("CronJob '{}' created to carry out check.", cron_job.name_any()),
                    )
                    .await;
                cron_job.metadata
            }
            None => {
                tracing::info!(assertion = %name, "Creating a Job");
                let mut job = job;
                adopt(&mut job.metadata, &owner);
                let job = self.workloads.replace_job(&namespace, &job).await?;
                self.events
                    .info(
                        assertion,
                        REASON_JOB_CREATED,
                        format!("Job '{}' created to carry out check.", job.name_any()),
                    )
                    .await;
                job.metadata
            }
        };

        let status = CreationStatus {
            job_name: created.name.unwrap_or_default(),
            job_uid: created.uid.unwrap_or_default(),
        };
        self.record_handled(assertion, &status).await?;

        self.metrics
            .handler_duration(&name, "create", started.elapsed());
        Ok(status)
    }

    pub async fn on_update(&self, assertion: &NetworkAssertion, old: &NetworkAssertionSpec) -> Result<()> {
        let started = Instant::now();
        let name = assertion.name_any();
        let namespace = assertion.namespace().unwrap_or_default();
        tracing::info!(assertion = %name, namespace = %namespace, "Mutation handler called");

        if old.schedule.is_some() {
            tracing::info!(assertion = %name, "Deleting CronJob");
            self.workloads.delete_cron_job(&namespace, &name).await?;
        } else {
            tracing::info!(assertion = %name, "Deleting Job");
            self.workloads.delete_job(&namespace, &name).await?;
        }
        self.workloads.delete_config_map(&namespace, &name).await?;

        tracing::info!(assertion = %name, "Recreating resources");
        self.on_create(assertion).await?;

        self.metrics
            .handler_duration(&name, "update", started.elapsed());
        Ok(())
    }

    pub async fn on_resume(&self, assertion: &NetworkAssertion) -> Result<CreationStatus> {
        tracing::info!(
            assertion = %assertion.name_any(),
            namespace = %assertion.namespace().unwrap_or_default(),
            "NetworkAssertion resume handler called"
        );
        self.on_create(assertion).await
    }

    pub fn on_delete(&self, assertion: &NetworkAssertion) {
        tracing::info!(
            assertion = %assertion.name_any(),
            namespace = %assertion.namespace().unwrap_or_default(),
            "NetworkAssertion delete handler called"
        );
    }

    /// Store `status.creation` and the handled spec
    async fn record_handled(&self, assertion: &NetworkAssertion, status: &CreationStatus) -> Result<()> {
        let name = assertion.name_any();
        let namespace = assertion.namespace().unwrap_or_default();
        let api: Api<NetworkAssertion> = Api::namespaced(self.client.clone(), &namespace);

        let status_patch = json!({ "status": { "creation": status } });
        api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&status_patch))
            .await?;

        let handled = handled_spec_annotation(&assertion.spec)?;
        let annotation_patch = json!({
            "metadata": { "annotations": { LAST_HANDLED_ANNOTATION: handled } }
        });
        api.patch(&name, &PatchParams::default(), &Patch::Merge(&annotation_patch))
            .await?;
        Ok(())
    }
}

/// Annotation value recording `spec` as handled
pub fn handled_spec_annotation(spec: &NetworkAssertionSpec) -> Result<String> {
    serde_json::to_string(spec).map_err(|source| Error::Serialization {
        what: "NetworkAssertion spec",
        source,
    })
}

/// Same spec as JSON, for comparisons in tests and logs
pub fn spec_value(spec: &NetworkAssertionSpec) -> Value {
    serde_json::to_value(spec).unwrap_or(Value::Null)
}
