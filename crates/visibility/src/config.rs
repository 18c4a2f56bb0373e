//! Configuration types for the observer and its logging setup.

use crate::error::{Result, VisibilityError};
use serde::{Deserialize, Serialize};

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON-formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Observer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Instrumentation library name used when a span does not override it.
    /// E.g. if you are instrumenting `YourCoolApp` then set this to `"YourCoolApp"`.
    pub library_name: String,
    /// Logical service name, attached to the root logger
    #[serde(default)]
    pub service_name: String,
    /// Deployment environment, attached to the root logger
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Report spans dropped without cleanup
    #[serde(default = "default_leak_check")]
    pub leak_check: bool,
}

fn default_leak_check() -> bool {
    true
}

impl ObserverConfig {
    /// Configuration with defaults for everything but the library name.
    pub fn new(library_name: impl Into<String>) -> Self {
        Self {
            library_name: library_name.into(),
            service_name: String::new(),
            environment: String::new(),
            logging: LoggingConfig::default(),
            leak_check: default_leak_check(),
        }
    }

    /// Check the configuration before building an observer.
    ///
    /// # Errors
    ///
    /// Returns `VisibilityError::Configuration` if the library name is blank.
    pub fn validate(&self) -> Result<()> {
        if self.library_name.trim().is_empty() {
            return Err(VisibilityError::Configuration(
                "library_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal() {
        let json = r#"{"library_name": "billing"}"#;
        let cfg: ObserverConfig = serde_json::from_str(json).expect("deserialize");

        assert_eq!(cfg.library_name, "billing");
        assert!(cfg.leak_check);
        assert_eq!(cfg.logging, LoggingConfig::default());
    }

    #[test]
    fn test_deserialize_full() {
        let json = r#"{
            "library_name": "billing",
            "service_name": "billing-api",
            "environment": "staging",
            "logging": {"level": "debug", "json": true},
            "leak_check": false
        }"#;
        let cfg: ObserverConfig = serde_json::from_str(json).expect("deserialize");

        assert_eq!(cfg.service_name, "billing-api");
        assert_eq!(cfg.environment, "staging");
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.logging.json);
        assert!(!cfg.leak_check);
    }

    #[test]
    fn test_validate_rejects_blank_library_name() {
        assert!(ObserverConfig::new("svc").validate().is_ok());
        assert!(matches!(
            ObserverConfig::new("  ").validate(),
            Err(VisibilityError::Configuration(_))
        ));
    }
}
