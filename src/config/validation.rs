use super::models::Config;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("hsds.min_confidence must be in [0, 1], got {0}")]
    InvalidMinConfidence(f64),

    #[error("hsds.retry_threshold must be in [0, 1], got {0}")]
    InvalidRetryThreshold(f64),

    #[error("hsds.min_confidence ({min_confidence}) must be >= hsds.retry_threshold ({retry_threshold})")]
    ThresholdOrdering { min_confidence: f64, retry_threshold: f64 },

    #[error("hsds.max_retries must be at least 1, got {0}")]
    InvalidMaxRetries(u32),

    #[error("redis.url is not a valid Redis connection string: {0}")]
    InvalidRedisUrl(String),

    #[error("content_store.path '{0}' is not usable as a directory: {1}")]
    UnusableContentStorePath(String, String),

    #[error("worker.pool_size must be at least 1, got {0}")]
    InvalidWorkerPoolSize(usize),
}

/// Validate the entire configuration. Structurally separate from loading so
/// a malformed-but-parseable config still fails fast at startup.
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_hsds(config)?;
    validate_redis(config)?;
    validate_content_store(config)?;
    validate_worker(config)?;
    Ok(())
}

fn validate_hsds(config: &Config) -> Result<(), ValidationError> {
    let hsds = &config.hsds;

    if !(0.0..=1.0).contains(&hsds.min_confidence) {
        return Err(ValidationError::InvalidMinConfidence(hsds.min_confidence));
    }
    if !(0.0..=1.0).contains(&hsds.retry_threshold) {
        return Err(ValidationError::InvalidRetryThreshold(hsds.retry_threshold));
    }
    if hsds.min_confidence < hsds.retry_threshold {
        return Err(ValidationError::ThresholdOrdering {
            min_confidence: hsds.min_confidence,
            retry_threshold: hsds.retry_threshold,
        });
    }
    if hsds.max_retries < 1 {
        return Err(ValidationError::InvalidMaxRetries(hsds.max_retries));
    }

    Ok(())
}

fn validate_redis(config: &Config) -> Result<(), ValidationError> {
    redis::Client::open(config.redis.url.as_str())
        .map_err(|e| ValidationError::InvalidRedisUrl(e.to_string()))?;
    Ok(())
}

fn validate_content_store(config: &Config) -> Result<(), ValidationError> {
    let Some(path) = &config.content_store.path else {
        return Ok(());
    };

    if path.exists() {
        if !path.is_dir() {
            return Err(ValidationError::UnusableContentStorePath(
                path.display().to_string(),
                "exists but is not a directory".to_string(),
            ));
        }
        return Ok(());
    }

    std::fs::create_dir_all(path)
        .map_err(|e| ValidationError::UnusableContentStorePath(path.display().to_string(), e.to_string()))
}

fn validate_worker(config: &Config) -> Result<(), ValidationError> {
    if config.worker.pool_size < 1 {
        return Err(ValidationError::InvalidWorkerPoolSize(config.worker.pool_size));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn retry_threshold_above_min_confidence_is_rejected() {
        let mut config = Config::default();
        config.hsds.retry_threshold = 0.9;
        config.hsds.min_confidence = 0.5;
        assert!(matches!(validate(&config), Err(ValidationError::ThresholdOrdering { .. })));
    }

    #[test]
    fn zero_max_retries_is_rejected() {
        let mut config = Config::default();
        config.hsds.max_retries = 0;
        assert!(matches!(validate(&config), Err(ValidationError::InvalidMaxRetries(0))));
    }

    #[test]
    fn invalid_redis_url_is_rejected() {
        let mut config = Config::default();
        config.redis.url = "not a url".to_string();
        assert!(matches!(validate(&config), Err(ValidationError::InvalidRedisUrl(_))));
    }

    #[test]
    fn content_store_path_is_created_if_absent() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("content-store");
        let mut config = Config::default();
        config.content_store.path = Some(path.clone());
        assert!(validate(&config).is_ok());
        assert!(path.is_dir());
    }

    #[test]
    fn zero_worker_pool_size_is_rejected() {
        let mut config = Config::default();
        config.worker.pool_size = 0;
        assert!(matches!(validate(&config), Err(ValidationError::InvalidWorkerPoolSize(0))));
    }
}
