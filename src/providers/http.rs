//! Chat-completions-style HTTP provider.

use super::{
    looks_like_refusal, strip_markdown_fence, GenerateConfig, LlmResponse, OutputFormat,
    Provider, ProviderError, Result, TokenUsage,
};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_name: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model_name: "gpt-4o-mini".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpProvider {
    client: Client,
    config: HttpConfig,
}

impl HttpProvider {
    pub fn new(config: HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn build_messages(&self, prompt: &str) -> Value {
        json!([{ "role": "user", "content": prompt }])
    }

    fn build_response_format(format: &OutputFormat) -> Value {
        match format {
            OutputFormat::JsonSchema { json_schema } => json!({
                "type": "json_schema",
                "json_schema": {
                    "name": json_schema.name,
                    "description": json_schema.description,
                    "strict": json_schema.strict,
                    "schema": json_schema.schema,
                }
            }),
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
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

        let mut body = json!({
            "model": self.config.model_name,
            "messages": self.build_messages(prompt),
        });

        if let Some(cfg) = config {
            if let Some(temp) = cfg.temperature {
                body["temperature"] = json!(temp);
            }
            if let Some(max_tokens) = cfg.max_tokens {
                body["max_tokens"] = json!(max_tokens);
            }
            if let Some(stop) = &cfg.stop_sequences {
                body["stop"] = json!(stop);
            }
        }

        if let Some(fmt) = effective_format {
            body["response_format"] = Self::build_response_format(fmt);
        }

        info!(model = %self.config.model_name, "sending chat completion request");

        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        let raw: Value = response.json().await?;

        if !status.is_success() {
            let message = extract_error_message(&raw);
            warn!(status = %status, message, "http provider returned an error");
            return Ok(LlmResponse {
                text: message,
                model: self.config.model_name.clone(),
                usage: TokenUsage::default(),
                raw,
                parsed: None,
                validation_details: None,
            });
        }

        let choices = raw.get("choices").and_then(Value::as_array);
        let content = choices
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str);

        let content = match content {
            None if choices.map(|c| c.is_empty()).unwrap_or(true) => {
                return Ok(LlmResponse {
                    text: "No response from model".to_string(),
                    model: self.config.model_name.clone(),
                    usage: TokenUsage::default(),
                    raw,
                    parsed: None,
                    validation_details: None,
                })
            }
            None => {
                return Ok(LlmResponse {
                    text: "Empty response from model".to_string(),
                    model: self.config.model_name.clone(),
                    usage: TokenUsage::default(),
                    raw,
                    parsed: None,
                    validation_details: None,
                })
            }
            Some(c) => c,
        };

        let usage = validate_usage(raw.get("usage"));
        debug!(chars = content.len(), "received chat completion response");

        let (text, parsed) = if effective_format.is_some() {
            process_json_content(content)
        } else {
            (content.to_string(), None)
        };

        Ok(LlmResponse {
            text,
            model: self.config.model_name.clone(),
            usage,
            raw,
            parsed,
            validation_details: None,
        })
    }
}

/// Mirrors the original provider's `_process_json_content`: strip the
/// markdown fence, try to parse JSON, and on failure preserve the content
/// verbatim if it reads as a refusal rather than replacing it with a
/// placeholder the aligner can't act on.
fn process_json_content(content: &str) -> (String, Option<Value>) {
    let stripped = strip_markdown_fence(content);
    match serde_json::from_str::<Value>(stripped) {
        Ok(value) => (stripped.to_string(), Some(value)),
        Err(_) if looks_like_refusal(content) => (content.to_string(), None),
        Err(_) => ("Invalid JSON response".to_string(), None),
    }
}

/// Extractors tried in order: nested `metadata.raw.error.message`, top-level
/// `message`, nested `error.message`, then stringification.
fn extract_error_message(raw: &Value) -> String {
    if let Some(m) = raw
        .get("metadata")
        .and_then(|m| m.get("raw"))
        .and_then(|r| r.get("error"))
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return m.to_string();
    }
    if let Some(m) = raw.get("message").and_then(Value::as_str) {
        return m.to_string();
    }
    if let Some(m) = raw
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return m.to_string();
    }
    raw.to_string()
}

fn validate_usage(usage: Option<&Value>) -> TokenUsage {
    let Some(usage) = usage else {
        return TokenUsage::default();
    };
    TokenUsage {
        prompt_tokens: usage
            .get("prompt_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        completion_tokens: usage
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        total_tokens: usage
            .get("total_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_json_content_parses_fenced_json() {
        let (text, parsed) = process_json_content("```json\n{\"a\":1}\n```");
        assert_eq!(text, "{\"a\":1}");
        assert_eq!(parsed, Some(json!({"a": 1})));
    }

    #[test]
    fn process_json_content_preserves_refusal_verbatim() {
        let (text, parsed) = process_json_content("I cannot help with that request");
        assert_eq!(text, "I cannot help with that request");
        assert!(parsed.is_none());
    }

    #[test]
    fn process_json_content_falls_back_to_placeholder() {
        let (text, parsed) = process_json_content("not json at all");
        assert_eq!(text, "Invalid JSON response");
        assert!(parsed.is_none());
    }

    #[test]
    fn extract_error_message_prefers_nested_metadata() {
        let raw = json!({
            "metadata": {"raw": {"error": {"message": "deep"}}},
            "message": "shallow",
        });
        assert_eq!(extract_error_message(&raw), "deep");
    }

    #[test]
    fn extract_error_message_falls_back_to_top_level() {
        let raw = json!({"message": "shallow"});
        assert_eq!(extract_error_message(&raw), "shallow");
    }
}
