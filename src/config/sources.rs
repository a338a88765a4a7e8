use super::models::Config;
use config::{ConfigError, Environment, File};
use std::env;
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "HSDS_ALIGNER_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/hsds-aligner.toml";
const ENV_PREFIX: &str = "HSDS_ALIGNER";
const ENV_SEPARATOR: &str = "__";

/// Load configuration from all sources with priority:
/// 1. Defaults (embedded in struct `Default` impls)
/// 2. TOML file (if present)
/// 3. `.env` file (via dotenvy)
/// 4. System environment variables (highest priority)
pub fn load() -> Result<Config, ConfigError> {
    let _ = dotenvy::dotenv();

    let config_path = env::var(CONFIG_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

    let mut config = load_from_sources(config_path)?;
    load_secrets(&mut config);
    Ok(config)
}

/// API keys are never read from the TOML file, only from the environment.
fn load_secrets(config: &mut Config) {
    if let Ok(key) = env::var("ANTHROPIC_API_KEY") {
        config.llm.api_key = Some(key);
    } else if let Ok(key) = env::var("LLM_API_KEY") {
        config.llm.api_key = Some(key);
    }
}

/// Loads from a specific path; useful for tests with custom config files.
pub fn load_from_sources(config_path: PathBuf) -> Result<Config, ConfigError> {
    let mut builder = config::Config::builder();

    if config_path.exists() {
        tracing::info!("Loading configuration from: {}", config_path.display());
        builder = builder.add_source(File::from(config_path).required(false));
    } else {
        tracing::warn!(
            "Configuration file not found at {}, using defaults and environment overrides",
            config_path.display()
        );
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    );

    let config = builder.build()?;
    config.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_only_when_no_file_present() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nonexistent.toml");

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.hsds.min_confidence, 0.82);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("test.toml");

        let toml_content = r#"
[llm]
provider = "cli"
model_name = "claude-sonnet-4-20250514"

[hsds]
min_confidence = 0.9
retry_threshold = 0.7
max_retries = 3

[redis]
url = "redis://cache:6379"
        "#;

        fs::write(&config_path, toml_content).unwrap();

        let config = load_from_sources(config_path).unwrap();
        assert_eq!(config.hsds.min_confidence, 0.9);
        assert_eq!(config.hsds.max_retries, 3);
        assert_eq!(config.redis.url, "redis://cache:6379");
    }
}
