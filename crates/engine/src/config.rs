use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::IntCoercion;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Engine settings, loaded from TOML. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub snapshot: SnapshotConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Longest chain of nested property evaluations before `MaxDepthExceeded`.
    pub max_depth: usize,
    /// Float -> int coercion for int settings without their own `int_rounding`.
    pub int_coercion: IntCoercion,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            max_depth: 64,
            int_coercion: IntCoercion::Truncate,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Emit keys whose `enabled` is false.
    pub include_disabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: "warn".to_string() }
    }
}

impl EngineConfig {
    pub fn from_toml(input: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.evaluation.max_depth == 0 {
            return Err(ConfigError::Validation("evaluation.max_depth must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_is_default() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.evaluation.max_depth, 64);
        assert_eq!(config.logging.filter, "warn");
        assert!(!config.snapshot.include_disabled);
    }

    #[test]
    fn test_partial_sections() {
        let config = EngineConfig::from_toml(
            r#"
[evaluation]
int_coercion = "round"

[snapshot]
include_disabled = true
"#,
        )
        .unwrap();
        assert_eq!(config.evaluation.int_coercion, IntCoercion::Round);
        assert_eq!(config.evaluation.max_depth, 64);
        assert!(config.snapshot.include_disabled);
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(matches!(
            EngineConfig::from_toml("[evaluation]\nint_coercion = \"floor\"").unwrap_err(),
            ConfigError::Parse(_)
        ));
        assert!(matches!(
            EngineConfig::from_toml("[evaluation]\nmax_depth = 0").unwrap_err(),
            ConfigError::Validation(_)
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(&path, "[logging]\nfilter = \"strata_engine=debug\"\n").unwrap();
        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.logging.filter, "strata_engine=debug");

        let missing = EngineConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
