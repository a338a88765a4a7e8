//! Layered configuration loading and validation.
//!
//! Priority (lowest to highest): compiled-in defaults, an optional TOML
//! file, then environment variables using a `HSDS_ALIGNER__SECTION__KEY`
//! convention. `.env` files are loaded via `dotenvy` before the environment
//! layer is read.

mod models;
mod sources;
mod validation;

pub use models::{
    ClaudeConfig, Config, ContentStoreConfig, HsdsConfig, LlmConfig, LlmProvider, LogFormat,
    LoggingConfig, RedisConfig, WorkerConfig,
};
pub use validation::ValidationError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] ValidationError),
}

impl Config {
    /// Loads configuration from all sources (defaults, TOML, environment).
    pub fn load() -> Result<Self, ConfigError> {
        let config = sources::load()?;
        validation::validate(&config)?;
        Ok(config)
    }

    /// Loads configuration from a specific TOML path; useful for tests.
    pub fn load_from_path(path: std::path::PathBuf) -> Result<Self, ConfigError> {
        let config = sources::load_from_sources(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn loads_and_validates_a_minimal_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(
            &config_path,
            r#"
[llm]
provider = "http"

[hsds]
min_confidence = 0.82
retry_threshold = 0.65
max_retries = 5
            "#,
        )
        .unwrap();

        let config = Config::load_from_path(config_path).unwrap();
        assert_eq!(config.hsds.max_retries, 5);
    }

    #[test]
    fn rejects_invalid_threshold_ordering() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        fs::write(
            &config_path,
            r#"
[hsds]
min_confidence = 0.3
retry_threshold = 0.9
            "#,
        )
        .unwrap();

        let result = Config::load_from_path(config_path);
        assert!(matches!(result, Err(ConfigError::Validation(ValidationError::ThresholdOrdering { .. }))));
    }
}
