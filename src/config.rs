use crate::error::Result;
use crate::search::SearchConfig;
use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Index location, query and synchronization options
    #[serde(default)]
    pub search: SearchConfig,

    /// Logging and metrics configuration, applied by `telemetry::init`
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/local.toml".to_string());

        let config = config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(&config_path).required(false))
            // Override with environment variables (prefix: ENTITY_SEARCH_)
            .add_source(
                config::Environment::with_prefix("ENTITY_SEARCH")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Service name
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Register the search metrics with the Prometheus registry at startup
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            service_name: default_service_name(),
            prometheus_enabled: true,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "entity-index-sync".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::MultiFieldMode;

    #[test]
    fn test_load_embedded_defaults() {
        let config = Config::load().unwrap();
        assert_eq!(config.search.default_page_size, 10);
        assert_eq!(config.search.multi_field_mode, MultiFieldMode::Or);
        assert_eq!(config.search.highlight.pre_tag, "<em>");
        assert_eq!(config.observability.log_level, "info");
    }

    #[test]
    fn test_partial_toml_uses_field_defaults() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                "[search]\nmulti_field_mode = \"and\"\nfuzzy_max_edits = 5\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.search.multi_field_mode, MultiFieldMode::And);
        assert_eq!(config.search.effective_fuzzy_edits(), 2);
        assert!(config.search.auto_indexing_enabled);
        assert!(config.observability.prometheus_enabled);
    }
}
