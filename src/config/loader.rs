//! Settings loading
//!
//! Handles loading settings from the built-in defaults, an optional file and
//! environment overrides.

use super::{
    defaults::{self, SETTINGS_FILE_ENV},
    schema::Settings,
};
use anyhow::{Context, Result};
use std::path::Path;

/// Settings loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load settings with all layers applied
    ///
    /// Precedence order (highest to lowest):
    /// 1. Environment variable overrides
    /// 2. File named by `JSON_CONFIG`
    /// 3. Built-in defaults
    pub fn load() -> Result<Settings> {
        let settings = match std::env::var(SETTINGS_FILE_ENV) {
            Ok(path) if !path.is_empty() => {
                tracing::debug!("Setting config from file {}", path);
                Self::load_file(Path::new(&path))?
            }
            _ => {
                tracing::debug!("Not loading config from file");
                Self::load_defaults()
            }
        };

        Ok(Self::apply_env_overrides(settings))
    }

    /// Load settings from a JSON or YAML file. Missing keys take their
    /// default values.
    pub fn load_file(path: &Path) -> Result<Settings> {
        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        // YAML is a superset of JSON
        let settings: Settings = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(settings)
    }

    /// Load default settings
    pub fn load_defaults() -> Settings {
        defaults::default_settings()
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(settings: Settings) -> Settings {
        Self::apply_overrides(settings, |key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(mut settings: Settings, lookup: F) -> Settings
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(tag) = lookup("NETCHECKS_PROBE_IMAGE_TAG") {
            settings.probe.image.tag = tag;
        }

        if let Some(repository) = lookup("NETCHECKS_PROBE_IMAGE_REPOSITORY") {
            settings.probe.image.repository = repository;
        }

        if let Some(max) = lookup("NETCHECKS_POLICY_REPORT_MAX_RESULTS") {
            match max.parse() {
                Ok(val) => settings.policy_report_max_results = val,
                Err(_) => tracing::warn!(
                    "Ignoring NETCHECKS_POLICY_REPORT_MAX_RESULTS={}: not a number",
                    max
                ),
            }
        }

        if let Some(enabled) = lookup("NETCHECKS_METRICS_ENABLED") {
            if let Ok(val) = enabled.parse::<bool>() {
                settings.metrics.enabled = val;
            }
        }

        settings
    }
}
