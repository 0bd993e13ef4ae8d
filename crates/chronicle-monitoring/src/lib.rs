//! Logging setup for the Chronicle history service.

use serde::{Deserialize, Serialize};
use std::env;

pub mod logging;
pub use logging::{init_logging, init_test_logging};

/// Configuration for initializing logging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log level filter (e.g., "info,chronicle_core=debug"); `RUST_LOG` wins when set
    pub log_filter: String,
    /// JSON lines instead of human readable output
    pub enable_json_logging: bool,
    /// Include source file and line in every record
    pub with_file_location: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            service_name: "chronicle-history".to_string(),
            log_filter: "info".to_string(),
            enable_json_logging: false,
            with_file_location: true,
        }
    }
}

impl MonitoringConfig {
    /// Defaults overridden by `CHRONICLE_LOG_FILTER` and `CHRONICLE_LOG_JSON`
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(filter) = env::var("CHRONICLE_LOG_FILTER") {
            config.log_filter = filter;
        }
        if let Ok(json) = env::var("CHRONICLE_LOG_JSON") {
            config.enable_json_logging = matches!(json.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }
        config
    }
}
