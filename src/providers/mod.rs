//! LLM provider abstraction: a uniform `generate` over an HTTP chat-completions
//! backend and a subprocess-CLI backend.

pub mod cli;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use cli::{CliConfig, CliProvider};
pub use http::{HttpConfig, HttpProvider};

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Claude authentication required: {message}")]
    Auth { message: String, retry_after: u64 },

    #[error("Claude quota exceeded: {message}")]
    Quota { message: String, retry_after: u64 },

    #[error("provider error: {0}")]
    Generic(String),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationDetails {
    pub hallucination_detected: bool,
    #[serde(default)]
    pub mismatched_fields: Vec<String>,
    #[serde(default)]
    pub suggested_corrections: BTreeMap<String, Option<String>>,
    pub feedback: Option<String>,
}

/// Response shape common to every provider. Immutable once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    pub usage: TokenUsage,
    pub raw: serde_json::Value,
    pub parsed: Option<serde_json::Value>,
    pub validation_details: Option<ValidationDetails>,
}

/// The structured-output descriptor handed to a provider's `generate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonSchemaDescriptor {
    pub name: String,
    pub description: String,
    pub strict: bool,
    pub schema: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputFormat {
    JsonSchema { json_schema: JsonSchemaDescriptor },
}

#[derive(Debug, Clone, Default)]
pub struct GenerateConfig {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stop_sequences: Option<Vec<String>>,
    pub stream: bool,
    /// A format embedded in the config itself; `generate`'s explicit `format`
    /// parameter takes precedence over this when both are set.
    pub format: Option<OutputFormat>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn model_name(&self) -> &str;
    fn supports_structured_output(&self) -> bool;

    async fn generate(
        &self,
        prompt: &str,
        format: Option<&OutputFormat>,
        config: Option<&GenerateConfig>,
    ) -> Result<LlmResponse>;
}

/// Strips a ```` ``` ```` or ```` ```json ```` fence wrapping a JSON body, if present.
pub fn strip_markdown_fence(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        if let Some(body) = rest.strip_suffix("```") {
            return body.trim();
        }
    }
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(body) = rest.strip_suffix("```") {
            return body.trim();
        }
    }
    trimmed
}

/// Builds the configured provider implementation. Each worker constructs its
/// own provider instance from config rather than sharing one, since providers
/// are never serialised across the queue.
pub fn build_provider(config: &crate::config::LlmConfig) -> Result<Box<dyn Provider>> {
    match config.provider {
        crate::config::LlmProvider::Http => {
            let http_config = HttpConfig {
                base_url: config.base_url.clone().unwrap_or_else(|| HttpConfig::default().base_url),
                api_key: config.api_key.clone(),
                model_name: config.model_name.clone(),
                ..HttpConfig::default()
            };
            Ok(Box::new(HttpProvider::new(http_config)?))
        }
        crate::config::LlmProvider::Cli => {
            let cli_config = CliConfig {
                binary: config.binary.clone().unwrap_or_else(|| CliConfig::default().binary),
                model_name: config.model_name.clone(),
                api_key: config.api_key.clone(),
                ..CliConfig::default()
            };
            Ok(Box::new(CliProvider::new(cli_config)))
        }
    }
}

const REFUSAL_PHRASES: &[&str] = &["cannot", "refuse"];

/// Case-insensitive check for a refusal marker in freeform model output.
/// Used by providers to decide whether to preserve unparseable text verbatim.
pub fn looks_like_refusal(text: &str) -> bool {
    let lower = text.to_lowercase();
    REFUSAL_PHRASES.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_json_fence() {
        let input = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_markdown_fence(input), "{\"a\":1}");
    }

    #[test]
    fn strips_plain_fence() {
        let input = "```\n{\"a\":1}\n```";
        assert_eq!(strip_markdown_fence(input), "{\"a\":1}");
    }

    #[test]
    fn leaves_unfenced_text_alone() {
        assert_eq!(strip_markdown_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn detects_refusal_case_insensitively() {
        assert!(looks_like_refusal("I CANNOT help with that"));
        assert!(looks_like_refusal("I must refuse this request"));
        assert!(!looks_like_refusal("here is your data"));
    }
}
