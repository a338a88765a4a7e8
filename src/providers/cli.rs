//! Subprocess-CLI provider: invokes a local command-line LLM client.

use super::{GenerateConfig, LlmResponse, OutputFormat, Provider, ProviderError, Result, TokenUsage};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const PLACEHOLDER_API_KEY: &str = "your_anthropic_api_key_here";
const AUTH_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

const AUTH_ERROR_MARKERS: &[&str] = &[
    "invalid api key",
    "fix external api key",
    "authentication",
    "login required",
    "not authenticated",
    "please log in",
];

const QUOTA_ERROR_MARKERS: &[&str] = &[
    "usage limit",
    "quota",
    "rate limit",
    "too many requests",
    "exceeded",
    "throttle",
    "usage cap",
];

#[derive(Debug, Clone)]
pub struct CliConfig {
    pub binary: String,
    pub model_name: String,
    pub api_key: Option<String>,
    pub quota_retry_after: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            model_name: "claude-sonnet-4-20250514".to_string(),
            api_key: None,
            quota_retry_after: 3600,
        }
    }
}

pub struct CliProvider {
    config: CliConfig,
}

impl CliProvider {
    pub fn new(config: CliConfig) -> Self {
        Self { config }
    }

    fn effective_api_key(&self) -> Option<&str> {
        self.config
            .api_key
            .as_deref()
            .filter(|k| *k != PLACEHOLDER_API_KEY)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(args);
        cmd.env_clear();
        cmd.env("PATH", "/usr/local/bin:/usr/bin:/bin");
        cmd.env("HOME", std::env::var("HOME").unwrap_or_else(|_| "/root".to_string()));
        if let Some(key) = self.effective_api_key() {
            cmd.env("ANTHROPIC_API_KEY", key);
        }
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd
    }

    /// Probe authentication with a trivial prompt and a 10 second wall clock.
    pub async fn check_authentication(&self) -> bool {
        let args = ["-p", "--output-format", "json", "Hello"];
        let run = async {
            let output = self.command(&args).output().await.ok()?;
            if !output.status.success() {
                return Some(false);
            }
            let stdout = String::from_utf8_lossy(&output.stdout);
            match serde_json::from_str::<Value>(&stdout) {
                Ok(data) => {
                    let result = data.get("result").and_then(Value::as_str).unwrap_or("");
                    let lower = result.to_lowercase();
                    if AUTH_ERROR_MARKERS.iter().any(|m| lower.contains(m)) {
                        return Some(false);
                    }
                    let is_error = data.get("is_error").and_then(Value::as_bool).unwrap_or(false);
                    Some(!is_error)
                }
                // Non-JSON stdout with exit code 0 is treated as authenticated.
                Err(_) => Some(true),
            }
        };

        match timeout(AUTH_CHECK_TIMEOUT, run).await {
            Ok(Some(healthy)) => healthy,
            Ok(None) => false,
            Err(_) => {
                warn!("authentication check timed out");
                false
            }
        }
    }

    fn build_prompt(prompt: &str, format: Option<&OutputFormat>) -> String {
        match format {
            Some(OutputFormat::JsonSchema { json_schema }) => {
                let schema_text = serde_json::to_string_pretty(&json_schema.schema)
                    .unwrap_or_else(|_| "{}".to_string());
                format!(
                    "You are a helpful assistant that always responds with valid JSON.\n\
                     Your response must be a complete, properly formatted JSON object that matches this schema:\n\n\
                     {schema_text}\n\n\
                     IMPORTANT: Only return the JSON object, no additional text or explanation.\n\n\
                     {prompt}"
                )
            }
            None => prompt.to_string(),
        }
    }

    fn is_quota_exceeded(output: &str) -> bool {
        let Ok(data) = serde_json::from_str::<Value>(output) else {
            return false;
        };
        let result = data.get("result").and_then(Value::as_str).unwrap_or("");
        let lower = result.to_lowercase();
        QUOTA_ERROR_MARKERS.iter().any(|m| lower.contains(m))
    }

    fn parse_output(output: &str, format: Option<&OutputFormat>) -> (String, Option<Value>) {
        if format.is_none() {
            return (output.trim().to_string(), None);
        }

        let Ok(data) = serde_json::from_str::<Value>(output) else {
            return (output.trim().to_string(), None);
        };

        if let Some(text) = data.get("result").and_then(Value::as_str) {
            let parsed = serde_json::from_str::<Value>(text).ok();
            (text.to_string(), parsed)
        } else {
            (data.to_string(), Some(data))
        }
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    fn supports_structured_output(&self) -> bool {
        true
    }

    async fn generate(
        &self,
        prompt: &str,
        format: Option<&OutputFormat>,
        config: Option<&GenerateConfig>,
    ) -> Result<LlmResponse> {
        let effective_format = format.or_else(|| config.and_then(|c| c.format.as_ref()));

        if !self.check_authentication().await {
            return Err(ProviderError::Auth {
                message: format!(
                    "Claude authentication required. Please run: {} (interactive login)",
                    self.config.binary
                ),
                retry_after: 300,
            });
        }

        let formatted_prompt = Self::build_prompt(prompt, effective_format);
        let output_format = if effective_format.is_some() { "json" } else { "text" };

        info!(model = %self.config.model_name, output_format, "invoking CLI provider");
        debug!(prompt_preview = %formatted_prompt.chars().take(200).collect::<String>());

        let output = self
            .command(&[
                "-p",
                "--output-format",
                output_format,
                "--model",
                &self.config.model_name,
                &formatted_prompt,
            ])
            .output()
            .await?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);

            if Self::is_quota_exceeded(&stdout) {
                warn!(retry_after = self.config.quota_retry_after, "CLI provider quota exceeded");
                return Err(ProviderError::Quota {
                    message: format!("Claude quota exceeded: {stdout}"),
                    retry_after: self.config.quota_retry_after,
                });
            }

            return Err(ProviderError::Generic(format!(
                "Claude CLI error (code {:?}): {stderr}. stdout: {stdout}",
                output.status.code()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let (text, parsed) = Self::parse_output(&stdout, effective_format);

        info!(chars = text.len(), "received CLI provider response");

        Ok(LlmResponse {
            text,
            model: self.config.model_name.clone(),
            usage: TokenUsage::default(),
            raw: serde_json::json!({ "output": stdout }),
            parsed,
            validation_details: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_quota_exceeded_detects_marker() {
        let output = serde_json::json!({"result": "Usage limit reached, try later"}).to_string();
        assert!(CliProvider::is_quota_exceeded(&output));
    }

    #[test]
    fn is_quota_exceeded_ignores_unrelated_text() {
        let output = serde_json::json!({"result": "here is your answer"}).to_string();
        assert!(!CliProvider::is_quota_exceeded(&output));
    }

    #[test]
    fn parse_output_extracts_result_and_parses_nested_json() {
        let output = serde_json::json!({"result": "{\"a\":1}"}).to_string();
        let (text, parsed) = CliProvider::parse_output(
            &output,
            Some(&OutputFormat::JsonSchema {
                json_schema: crate::providers::JsonSchemaDescriptor {
                    name: "x".into(),
                    description: "x".into(),
                    strict: true,
                    schema: serde_json::json!({}),
                },
            }),
        );
        assert_eq!(text, "{\"a\":1}");
        assert_eq!(parsed, Some(serde_json::json!({"a": 1})));
    }

    #[test]
    fn parse_output_without_format_returns_trimmed_text() {
        let (text, parsed) = CliProvider::parse_output("  hello  \n", None);
        assert_eq!(text, "hello");
        assert!(parsed.is_none());
    }
}
