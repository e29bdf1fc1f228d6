//! Operator settings schema
//!
//! Defines the structure of the settings file using serde for serialization.

use k8s_openapi::api::core::v1::{Affinity, ResourceRequirements, Toleration};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root settings structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Probe pod configuration
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Upper bound on results kept in one PolicyReport
    #[serde(
        default = "default_policy_report_max_results",
        alias = "policy_report_max_results"
    )]
    pub policy_report_max_results: usize,
}

/// Probe pod configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// Names of image pull secrets for the probe pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,

    /// Annotations added to every probe pod
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pod_annotations: BTreeMap<String, String>,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerations: Option<Vec<Toleration>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Pass `--verbose` to the probe
    #[serde(default = "default_false")]
    pub verbose: bool,
}

/// Probe image configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    #[serde(default = "default_repository")]
    pub repository: String,

    #[serde(default = "default_pull_policy")]
    pub pull_policy: String,

    #[serde(default = "default_tag")]
    pub tag: String,
}

impl ImageConfig {
    /// `repository:tag`
    pub fn reference(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

fn default_repository() -> String {
    "ghcr.io/hardbyte/netchecks".to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_tag() -> String {
    "main".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_policy_report_max_results() -> usize {
    1000
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            metrics: MetricsConfig::default(),
            policy_report_max_results: default_policy_report_max_results(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            repository: default_repository(),
            pull_policy: default_pull_policy(),
            tag: default_tag(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
            enabled: default_true(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.probe.image.reference(), "ghcr.io/hardbyte/netchecks:main");
        assert_eq!(settings.probe.image.pull_policy, "IfNotPresent");
        assert_eq!(settings.metrics.port, 9090);
        assert!(settings.metrics.enabled);
        assert_eq!(settings.policy_report_max_results, 1000);
        assert!(!settings.probe.verbose);
    }

    #[test]
    fn test_settings_deserialization() {
        let json = r#"{
            "probe": {
                "image": {"repository": "custom/image", "tag": "v1.2.3"},
                "podAnnotations": {"sidecar.istio.io/inject": "false"},
                "imagePullSecrets": ["regcred"],
                "resources": {"limits": {"memory": "128Mi"}},
                "tolerations": [{"key": "dedicated", "operator": "Exists"}],
                "verbose": true
            },
            "metrics": {"port": 8888, "enabled": false},
            "policy_report_max_results": 500
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.probe.image.reference(), "custom/image:v1.2.3");
        assert_eq!(settings.probe.image.pull_policy, "IfNotPresent");
        assert_eq!(settings.probe.image_pull_secrets, vec!["regcred"]);
        assert_eq!(settings.probe.tolerations.as_ref().unwrap().len(), 1);
        assert!(settings.probe.resources.is_some());
        assert!(settings.probe.verbose);
        assert_eq!(settings.metrics.port, 8888);
        assert!(!settings.metrics.enabled);
        assert_eq!(settings.policy_report_max_results, 500);
    }

    #[test]
    fn test_settings_serialization() {
        let yaml = serde_yaml::to_string(&Settings::default()).unwrap();
        assert!(yaml.contains("policyReportMaxResults"));
        assert!(yaml.contains("pullPolicy"));
    }
}
