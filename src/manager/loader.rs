//! Manager configuration loading from TOML.
//!
//! ```toml
//! include_defaults = true
//!
//! [[breaker]]
//! name = "database"
//! failure_threshold = 3
//! timeout_ms = 2000
//!
//! [[breaker]]
//! name = "ledger"
//! sleep_window_ms = 15000
//! ```
//!
//! Omitted fields take the [`CircuitBreakerConfig`] defaults. With
//! `include_defaults` (the default) the listed breakers are merged over the
//! built-in table, replacing entries with the same name.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::core::ConfigError;
use crate::manager::defaults;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// Configuration for a whole manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Seed the registry with the built-in dependency table first.
    pub include_defaults: bool,

    /// Breakers to register.
    #[serde(rename = "breaker")]
    pub breakers: Vec<CircuitBreakerConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            include_defaults: true,
            breakers: Vec::new(),
        }
    }
}

impl ManagerConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: ManagerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;

        tracing::debug!(
            path = %path.display(),
            breakers = config.breakers.len(),
            include_defaults = config.include_defaults,
            "Loaded circuit breaker configuration"
        );

        Ok(config)
    }

    /// Validates every breaker and rejects duplicate names.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for breaker in &self.breakers {
            breaker.validate()?;
            if !seen.insert(breaker.name.as_str()) {
                return Err(ConfigError::invalid(
                    &breaker.name,
                    "breaker is configured more than once",
                ));
            }
        }
        Ok(())
    }

    /// Returns the effective configuration table: the defaults (if included)
    /// with the listed breakers merged over them.
    pub fn resolved(&self) -> Vec<CircuitBreakerConfig> {
        let mut table = if self.include_defaults {
            defaults::default_configs()
        } else {
            Vec::new()
        };

        for breaker in &self.breakers {
            match table.iter_mut().find(|existing| existing.name == breaker.name) {
                Some(existing) => *existing = breaker.clone(),
                None => table.push(breaker.clone()),
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = r#"
        [[breaker]]
        name = "database"
        failure_threshold = 4
        timeout_ms = 2000

        [[breaker]]
        name = "ledger"
        sleep_window_ms = 15000
        error_percent_threshold = 0
    "#;

    #[test]
    fn test_parse_with_defaults_merged() {
        let config = ManagerConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.include_defaults);
        assert_eq!(config.breakers.len(), 2);

        let database = &config.breakers[0];
        assert_eq!(database.failure_threshold, 4);
        assert_eq!(database.timeout, Duration::from_secs(2));
        assert_eq!(database.success_threshold, 3);

        let table = config.resolved();
        let names: Vec<_> = table.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                defaults::PASSKEY_PROVIDER,
                defaults::DATABASE,
                defaults::MESSAGE_BUS,
                "ledger"
            ]
        );
        assert_eq!(table[1].failure_threshold, 4);
        assert_eq!(table[3].sleep_window, Duration::from_secs(15));
    }

    #[test]
    fn test_without_defaults() {
        let config = ManagerConfig::from_toml_str(
            r#"
            include_defaults = false

            [[breaker]]
            name = "search"
            "#,
        )
        .unwrap();

        let table = config.resolved();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].name, "search");
    }

    #[test]
    fn test_empty_document() {
        let config = ManagerConfig::from_toml_str("").unwrap();
        assert_eq!(config, ManagerConfig::default());
        assert_eq!(config.resolved().len(), 3);
    }

    #[test]
    fn test_invalid_breaker_is_rejected() {
        let err = ManagerConfig::from_toml_str(
            r#"
            [[breaker]]
            name = "database"
            success_threshold = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref name, .. } if name == "database"));
    }

    #[test]
    fn test_missing_name_is_rejected() {
        let err = ManagerConfig::from_toml_str("[[breaker]]\nfailure_threshold = 2\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_duplicate_names_are_rejected() {
        let err = ManagerConfig::from_toml_str(
            r#"
            [[breaker]]
            name = "cache"

            [[breaker]]
            name = "cache"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_parse_error() {
        let err = ManagerConfig::from_toml_str("[[breaker]\nname = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = ManagerConfig::from_toml_str("[[breaker]]\nname = \"x\"\ntimeout_ms = \"fast\"\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ManagerConfig::load(file.path()).unwrap();
        assert_eq!(config.breakers.len(), 2);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = ManagerConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
