//! Default configuration values

use super::schema::Settings;

/// Environment variable naming the settings file
pub const SETTINGS_FILE_ENV: &str = "JSON_CONFIG";

/// Get the default settings
pub fn default_settings() -> Settings {
    Settings::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = default_settings();
        assert_eq!(settings.probe.image.tag, "main");
        assert_eq!(settings.policy_report_max_results, 1000);
    }
}
