//! Operator configuration
//!
//! Settings are loaded once at startup (defaults, then the `JSON_CONFIG`
//! file, then environment overrides) and shared read-only afterwards.

mod defaults;
pub mod loader;
pub mod schema;

pub use defaults::SETTINGS_FILE_ENV;
pub use loader::ConfigLoader;
pub use schema::{ImageConfig, MetricsConfig, ProbeConfig, Settings};

/// Get a settings value by key (dot notation)
pub fn get_config_value(settings: &Settings, key: &str) -> anyhow::Result<String> {
    match key {
        "probe.image.repository" => Ok(settings.probe.image.repository.clone()),
        "probe.image.tag" => Ok(settings.probe.image.tag.clone()),
        "probe.image.pullPolicy" => Ok(settings.probe.image.pull_policy.clone()),
        "probe.verbose" => Ok(settings.probe.verbose.to_string()),
        "metrics.enabled" => Ok(settings.metrics.enabled.to_string()),
        "metrics.port" => Ok(settings.metrics.port.to_string()),
        "policyReportMaxResults" => Ok(settings.policy_report_max_results.to_string()),
        _ => Err(anyhow::anyhow!("Unknown configuration key: {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_config_value() {
        let settings = Settings::default();
        assert_eq!(get_config_value(&settings, "probe.image.tag").unwrap(), "main");
        assert_eq!(get_config_value(&settings, "metrics.port").unwrap(), "9090");
        assert!(get_config_value(&settings, "ui.skin").is_err());
    }
}
