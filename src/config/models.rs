use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub hsds: HsdsConfig,
    #[serde(default)]
    pub claude: ClaudeConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub content_store: ContentStoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm: LlmConfig::default(),
            hsds: HsdsConfig::default(),
            claude: ClaudeConfig::default(),
            redis: RedisConfig::default(),
            content_store: ContentStoreConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Http,
    Cli,
}

impl Default for LlmProvider {
    fn default() -> Self {
        LlmProvider::Http
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub base_url: Option<String>,
    #[serde(skip)]
    pub api_key: Option<String>,
    pub binary: Option<String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProvider::default(),
            model_name: default_model_name(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            base_url: None,
            api_key: None,
            binary: None,
        }
    }
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_max_tokens() -> u32 {
    4000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HsdsConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default = "default_retry_threshold")]
    pub retry_threshold: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub aligner_prompt_path: Option<PathBuf>,
    pub validation_prompt_path: Option<PathBuf>,
    pub schema_path: Option<PathBuf>,
}

impl Default for HsdsConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            retry_threshold: default_retry_threshold(),
            max_retries: default_max_retries(),
            aligner_prompt_path: None,
            validation_prompt_path: None,
            schema_path: None,
        }
    }
}

fn default_min_confidence() -> f64 {
    0.82
}

fn default_retry_threshold() -> f64 {
    0.65
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeConfig {
    #[serde(default = "default_quota_retry_delay")]
    pub quota_retry_delay: u64,
    #[serde(default = "default_quota_max_delay")]
    pub quota_max_delay: u64,
    #[serde(default = "default_quota_backoff_multiplier")]
    pub quota_backoff_multiplier: f64,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            quota_retry_delay: default_quota_retry_delay(),
            quota_max_delay: default_quota_max_delay(),
            quota_backoff_multiplier: default_quota_backoff_multiplier(),
        }
    }
}

fn default_quota_retry_delay() -> u64 {
    3600
}

fn default_quota_max_delay() -> u64 {
    86400
}

fn default_quota_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_redis_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            max_retries: default_redis_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_redis_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContentStoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    #[serde(default = "default_pool_size_workers")]
    pub pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pool_size: default_pool_size_workers() }
    }
}

fn default_pool_size_workers() -> usize {
    4
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Plain,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Plain
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_log_level(), format: LogFormat::default() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_thresholds() {
        let config = Config::default();
        assert_eq!(config.hsds.min_confidence, 0.82);
        assert_eq!(config.hsds.retry_threshold, 0.65);
        assert_eq!(config.hsds.max_retries, 5);
        assert_eq!(config.worker.pool_size, 4);
    }
}
