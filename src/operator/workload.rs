//! Workload manager
//!
//! Builds the ConfigMap, Job and CronJob that carry out a NetworkAssertion's
//! checks, and writes them to the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, LocalObjectReference, PodSpec, PodTemplateSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::{Value, json};

use super::error::{Error, Result, is_not_found};
use crate::config::Settings;
use crate::models::{ContextDef, ResolvedConfig, Rule, network_assertion::context_mount_path};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "netchecks-operator";

pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_VERSION: &str = "app.kubernetes.io/version";
pub const LABEL_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";

pub const APP_NAME: &str = "netchecks";
pub const PROBE_COMPONENT: &str = "probe";

pub const RULES_VOLUME: &str = "netcheck-rules";
pub const RULES_MOUNT_PATH: &str = "/netcheck";
pub const CONFIG_FILE_KEY: &str = "config.json";
pub const PROBE_CONTAINER: &str = "netcheck";
pub const JOB_BACKOFF_LIMIT: i32 = 4;

/// Labels shared by everything derived from one NetworkAssertion
pub fn common_labels(assertion: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_NAME.to_string(), APP_NAME.to_string()),
        (
            LABEL_VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        (LABEL_INSTANCE.to_string(), assertion.to_string()),
    ])
}

/// Labels on probe pods
pub fn probe_labels(assertion: &str) -> BTreeMap<String, String> {
    let mut labels = common_labels(assertion);
    labels.insert(LABEL_COMPONENT.to_string(), PROBE_COMPONENT.to_string());
    labels
}

/// Label selector matching every probe pod
pub fn probe_pod_selector() -> String {
    format!("{LABEL_NAME}={APP_NAME},{LABEL_COMPONENT}={PROBE_COMPONENT}")
}

/// Set `owner` as the controller of an object
pub fn adopt(meta: &mut ObjectMeta, owner: &OwnerReference) {
    meta.owner_references = Some(vec![owner.clone()]);
}

/// ConfigMap holding the probe configuration under `config.json`
pub fn build_config_map(assertion: &str, rules: &[Rule], contexts: &[ContextDef]) -> Result<ConfigMap> {
    let document = ResolvedConfig::from_assertion(assertion, rules, contexts);
    let encoded = serde_json::to_string(&document).map_err(|source| Error::Serialization {
        what: "probe configuration",
        source,
    })?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(assertion.to_string()),
            labels: Some(common_labels(assertion)),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(CONFIG_FILE_KEY.to_string(), encoded)])),
        ..Default::default()
    })
}

/// Volume for a configMap or secret context; inline contexts need none.
///
/// The source is passed through as authored, except that a secret's `name`
/// becomes `secretName`.
pub fn context_volume(context: &ContextDef) -> Result<Option<Volume>> {
    let source = if let Some(config_map) = &context.config_map {
        json!({ "name": context.name, "configMap": config_map })
    } else if let Some(secret) = &context.secret {
        let mut secret = secret.clone();
        if let Some(name) = secret.remove("name") {
            secret.entry("secretName").or_insert(name);
        }
        json!({ "name": context.name, "secret": secret })
    } else {
        return Ok(None);
    };

    serde_json::from_value(source).map(Some).map_err(|e| {
        Error::InvalidAssertion(format!("context '{}' has an invalid volume source: {e}", context.name))
    })
}

/// Command run by the probe container
pub fn probe_command(disable_redaction: bool, verbose: bool) -> Vec<String> {
    let mut command: Vec<String> = ["netcheck", "run", "--config"]
        .into_iter()
        .map(String::from)
        .collect();
    command.push(format!("{RULES_MOUNT_PATH}/{CONFIG_FILE_KEY}"));
    if disable_redaction {
        command.push("--disable-redaction".to_string());
    }
    if verbose {
        command.push("--verbose".to_string());
    }
    command
}

/// Job spec for one probe run
pub fn build_job_spec(
    name: &str,
    config_map_name: &str,
    contexts: &[ContextDef],
    settings: &Settings,
    overrides: Option<&Value>,
    disable_redaction: bool,
) -> Result<JobSpec> {
    let rules_volume: Volume = serde_json::from_value(json!({
        "name": RULES_VOLUME,
        "configMap": { "name": config_map_name },
    }))
    .map_err(|source| Error::Serialization {
        what: "rules volume",
        source,
    })?;

    let mut volumes = vec![rules_volume];
    let mut volume_mounts = vec![VolumeMount {
        name: RULES_VOLUME.to_string(),
        mount_path: RULES_MOUNT_PATH.to_string(),
        ..Default::default()
    }];

    for context in contexts {
        if let Some(volume) = context_volume(context)? {
            volume_mounts.push(VolumeMount {
                name: context.name.clone(),
                mount_path: context_mount_path(&context.name),
                ..Default::default()
            });
            volumes.push(volume);
        }
    }

    let probe = &settings.probe;
    let command = probe_command(disable_redaction, probe.verbose);
    tracing::debug!("Probe command {:?}", command);

    let container = Container {
        name: PROBE_CONTAINER.to_string(),
        image: Some(probe.image.reference()),
        image_pull_policy: Some(probe.image.pull_policy.clone()),
        command: Some(command),
        volume_mounts: Some(volume_mounts),
        resources: probe.resources.clone(),
        ..Default::default()
    };

    let image_pull_secrets = (!probe.image_pull_secrets.is_empty()).then(|| {
        probe
            .image_pull_secrets
            .iter()
            .map(|name| LocalObjectReference { name: name.clone() })
            .collect()
    });

    let template = PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(probe_labels(name)),
            annotations: (!probe.pod_annotations.is_empty()).then(|| probe.pod_annotations.clone()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            containers: vec![container],
            volumes: Some(volumes),
            image_pull_secrets,
            tolerations: probe.tolerations.clone(),
            affinity: probe.affinity.clone(),
            ..Default::default()
        }),
    };

    let template = match overrides {
        Some(overrides) => {
            tracing::info!("Applying template overrides");
            apply_overrides(template, overrides)?
        }
        None => template,
    };

    Ok(JobSpec {
        template,
        backoff_limit: Some(JOB_BACKOFF_LIMIT),
        ..Default::default()
    })
}

/// Deep-merge an override document onto a pod template.
///
/// Keys use the manifest (camelCase) names. Objects merge recursively;
/// anything else, lists included, replaces the existing value.
pub fn apply_overrides(template: PodTemplateSpec, overrides: &Value) -> Result<PodTemplateSpec> {
    let mut merged = serde_json::to_value(&template).map_err(|source| Error::Serialization {
        what: "pod template",
        source,
    })?;
    merge_json(&mut merged, overrides);
    serde_json::from_value(merged)
        .map_err(|e| Error::InvalidAssertion(format!("template overrides are invalid: {e}")))
}

/// Recursively merge `overrides` into `base`
pub fn merge_json(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                let nested = value.is_object() && base.get(key).is_some_and(Value::is_object);
                if !nested {
                    base.insert(key.clone(), value.clone());
                } else if let Some(existing) = base.get_mut(key) {
                    merge_json(existing, value);
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

pub fn build_job(name: &str, spec: JobSpec) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(common_labels(name)),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

pub fn build_cron_job_spec(schedule: &str, job: &Job) -> CronJobSpec {
    CronJobSpec {
        schedule: schedule.to_string(),
        job_template: JobTemplateSpec {
            metadata: Some(job.metadata.clone()),
            spec: job.spec.clone(),
        },
        ..Default::default()
    }
}

pub fn build_cron_job(name: &str, spec: CronJobSpec) -> CronJob {
    CronJob {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(common_labels(name)),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// Writes workloads to the cluster
#[derive(Clone)]
pub struct WorkloadManager {
    client: Client,
}

impl WorkloadManager {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create or update the ConfigMap with server-side apply
    pub async fn apply_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api.patch(&name, &params, &Patch::Apply(config_map)).await?;
        tracing::info!(namespace, config_map = %name, "Applied config map");
        Ok(applied)
    }

    /// Replace the Job: a Job's pod template is immutable, so any existing
    /// Job is deleted first
    pub async fn replace_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let name = job.metadata.name.clone().unwrap_or_default();
        self.delete_job(namespace, &name).await?;
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let created = api.create(&PostParams::default(), job).await?;
        tracing::info!(namespace, job = %name, "Created job");
        Ok(created)
    }

    /// Replace the CronJob if it exists, otherwise create it
    pub async fn replace_cron_job(&self, namespace: &str, cron_job: &CronJob) -> Result<CronJob> {
        let name = cron_job.metadata.name.clone().unwrap_or_default();
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);

        match api.get_opt(&name).await? {
            Some(existing) => {
                let mut desired = cron_job.clone();
                desired.metadata.resource_version = existing.metadata.resource_version;
                let replaced = api.replace(&name, &PostParams::default(), &desired).await?;
                tracing::info!(namespace, cron_job = %name, "Replaced cron job");
                Ok(replaced)
            }
            None => {
                let created = api.create(&PostParams::default(), cron_job).await?;
                tracing::info!(namespace, cron_job = %name, "Created cron job");
                Ok(created)
            }
        }
    }

    /// Delete a Job and its pods, ignoring a missing Job
    pub async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        tolerate_missing(api.delete(name, &DeleteParams::background()).await, "Job", name)
    }

    pub async fn delete_cron_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        tolerate_missing(api.delete(name, &DeleteParams::background()).await, "CronJob", name)
    }

    pub async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        tolerate_missing(api.delete(name, &DeleteParams::default()).await, "ConfigMap", name)
    }
}

fn tolerate_missing<T>(result: std::result::Result<T, kube::Error>, kind: &str, name: &str) -> Result<()> {
    match result {
        Ok(_) => {
            tracing::info!("Deleted {} {}", kind, name);
            Ok(())
        }
        Err(e) if is_not_found(&e) => {
            tracing::info!("Couldn't find existing {} {}. Ignoring", kind, name);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
