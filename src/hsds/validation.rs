//! LLM-as-judge validation of an HSDS payload, fused with the deterministic
//! field validator.

use super::field_validator::{FieldValidator, KnownFields};
use crate::providers::{
    GenerateConfig, JsonSchemaDescriptor, OutputFormat, Provider, ProviderError,
};
use crate::prompts::{PromptError, PromptLoader};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("judge provider failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("judge response was not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("judge response is missing required fields: {0}")]
    MalformedResponse(String),

    #[error("streaming responses are not supported for validation")]
    Streaming,

    #[error("prompt template error: {0}")]
    Prompt(#[from] PromptError),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub min_confidence: f64,
    pub retry_threshold: f64,
    pub max_retries: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.82,
            retry_threshold: 0.65,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub confidence: f64,
    pub hallucination_detected: bool,
    #[serde(default)]
    pub missing_required_fields: Vec<String>,
    pub feedback: Option<String>,
    #[serde(default)]
    pub mismatched_fields: Option<Vec<String>>,
    #[serde(default)]
    pub suggested_corrections: Option<BTreeMap<String, Option<String>>>,
}

/// Streaming provider responses can't be validated as a single JSON payload,
/// so a request asking for one is rejected before it reaches the provider.
pub(crate) fn reject_streaming(config: &GenerateConfig) -> Result<()> {
    if config.stream {
        return Err(ValidationError::Streaming);
    }
    Ok(())
}

fn judge_schema() -> JsonSchemaDescriptor {
    JsonSchemaDescriptor {
        name: "validation_result".to_string(),
        description: "Judgement of an HSDS alignment attempt".to_string(),
        strict: true,
        schema: json!({
            "type": "object",
            "properties": {
                "confidence": {"type": "number"},
                "feedback": {"type": ["string", "null"]},
                "hallucination_detected": {"type": "boolean"},
                "mismatched_fields": {"type": "array", "items": {"type": "string"}},
                "suggested_corrections": {"type": "object"},
                "missing_required_fields": {"type": "array", "items": {"type": "string"}},
            },
            "required": ["confidence", "hallucination_detected", "missing_required_fields"],
            "additionalProperties": false,
        }),
    }
}

pub struct ValidationProvider<'a> {
    provider: &'a dyn Provider,
    config: ValidationConfig,
    field_validator: FieldValidator,
    prompts: &'a PromptLoader,
}

impl<'a> ValidationProvider<'a> {
    pub fn new(provider: &'a dyn Provider, config: ValidationConfig, prompts: &'a PromptLoader) -> Self {
        Self {
            provider,
            config,
            field_validator: FieldValidator::new(),
            prompts,
        }
    }

    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    pub async fn validate(
        &self,
        raw_data: &str,
        hsds_data: &Value,
        known_fields: Option<&KnownFields>,
    ) -> Result<ValidationResult> {
        let missing_fields = self.field_validator.validate_required_fields(hsds_data);
        let field_confidence = self
            .field_validator
            .calculate_confidence(&missing_fields, known_fields);
        let field_feedback = self.field_validator.generate_feedback(&missing_fields);

        let prompt = self.prepare_prompt(raw_data, hsds_data)?;
        let format = OutputFormat::JsonSchema { json_schema: judge_schema() };
        let config = GenerateConfig {
            temperature: Some(0.7),
            max_tokens: Some(4000),
            format: Some(format.clone()),
            ..Default::default()
        };
        reject_streaming(&config)?;

        let response = self.provider.generate(&prompt, Some(&format), Some(&config)).await?;

        let judge_value = match &response.parsed {
            Some(value) => value.clone(),
            None => serde_json::from_str(&response.text)?,
        };

        let mut result: ValidationResult = serde_json::from_value(judge_value)
            .map_err(|e| ValidationError::MalformedResponse(e.to_string()))?;

        result.missing_required_fields = missing_fields;
        result.confidence = result.confidence.min(field_confidence);
        result.feedback = match (result.feedback.filter(|f| !f.is_empty()), field_feedback.is_empty()) {
            (Some(judge_feedback), false) => Some(format!("{judge_feedback}\n\n{field_feedback}")),
            (Some(judge_feedback), true) => Some(judge_feedback),
            (None, false) => Some(field_feedback),
            (None, true) => None,
        };

        Ok(result)
    }

    fn prepare_prompt(&self, raw_data: &str, hsds_data: &Value) -> Result<String> {
        let template = self.prompts.validation_prompt()?;
        let hsds_text = serde_json::to_string_pretty(hsds_data).unwrap_or_default();
        Ok(template
            .replace("{input_data}", raw_data)
            .replace("{hsds_output}", &hsds_text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LlmResponse, TokenUsage};
    use async_trait::async_trait;

    struct StubProvider {
        response: String,
    }

    #[async_trait]
    impl Provider for StubProvider {
        fn model_name(&self) -> &str {
            "stub"
        }

        fn supports_structured_output(&self) -> bool {
            true
        }

        async fn generate(
            &self,
            _prompt: &str,
            _format: Option<&OutputFormat>,
            _config: Option<&GenerateConfig>,
        ) -> crate::providers::Result<LlmResponse> {
            Ok(LlmResponse {
                text: self.response.clone(),
                model: "stub".to_string(),
                usage: TokenUsage::default(),
                raw: json!({}),
                parsed: serde_json::from_str(&self.response).ok(),
                validation_details: None,
            })
        }
    }

    #[tokio::test]
    async fn fuses_judge_and_field_confidence_taking_the_minimum() {
        let judge = json!({
            "confidence": 0.95,
            "hallucination_detected": false,
            "missing_required_fields": [],
            "feedback": "looks fine",
        })
        .to_string();
        let provider = StubProvider { response: judge };
        let prompts = PromptLoader::new(None, None);
        let validator = ValidationProvider::new(&provider, ValidationConfig::default(), &prompts);

        let hsds_data = json!({"organization": [{}]});
        let result = validator.validate("raw text", &hsds_data, None).await.unwrap();

        assert!(result.confidence < 0.95);
        assert!(!result.missing_required_fields.is_empty());
    }

    #[tokio::test]
    async fn missing_required_fields_always_come_from_field_validator() {
        let judge = json!({
            "confidence": 0.9,
            "hallucination_detected": false,
            "missing_required_fields": ["should_be_overwritten"],
        })
        .to_string();
        let provider = StubProvider { response: judge };
        let prompts = PromptLoader::new(None, None);
        let validator = ValidationProvider::new(&provider, ValidationConfig::default(), &prompts);

        let hsds_data = json!({"organization": [], "service": [], "location": []});
        let result = validator.validate("raw text", &hsds_data, None).await.unwrap();

        assert!(!result.missing_required_fields.contains(&"should_be_overwritten".to_string()));
    }

    #[tokio::test]
    async fn malformed_judge_response_is_an_error() {
        let provider = StubProvider { response: "not json".to_string() };
        let prompts = PromptLoader::new(None, None);
        let validator = ValidationProvider::new(&provider, ValidationConfig::default(), &prompts);
        let hsds_data = json!({});
        assert!(validator.validate("raw", &hsds_data, None).await.is_err());
    }

    #[test]
    fn streaming_requests_are_rejected_before_calling_the_provider() {
        let config = GenerateConfig { stream: true, ..Default::default() };
        assert!(matches!(reject_streaming(&config), Err(ValidationError::Streaming)));
    }

    #[test]
    fn non_streaming_requests_pass_the_guard() {
        let config = GenerateConfig::default();
        assert!(reject_streaming(&config).is_ok());
    }
}
