//! Common configuration types for SFU components.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Log output format selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable single-line output.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Default `EnvFilter` directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl ObservabilityConfig {
    /// Read `SFU_LOG_FORMAT` (`text` or `json`) from the given variables.
    ///
    /// Unknown formats fall back to text.
    #[must_use]
    pub fn from_vars(vars: &HashMap<String, String>, default_filter: &str) -> Self {
        let log_format = match vars.get("SFU_LOG_FORMAT").map(|s| s.to_ascii_lowercase()) {
            Some(ref f) if f == "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Self {
            default_filter: default_filter.to_string(),
            log_format,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_defaults_to_text() {
        let config = ObservabilityConfig::from_vars(&HashMap::new(), "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.default_filter, "info");
    }

    #[test]
    fn test_log_format_json_is_case_insensitive() {
        let vars = HashMap::from([("SFU_LOG_FORMAT".to_string(), "JSON".to_string())]);
        let config = ObservabilityConfig::from_vars(&vars, "info");
        assert_eq!(config.log_format, LogFormat::Json);
    }
}
