//! The alignment retry loop: repeatedly prompts the LLM aligner and judge
//! until the result clears a confidence bar or retries are exhausted.

use super::field_validator::KnownFields;
use super::validation::{reject_streaming, ValidationConfig, ValidationError, ValidationProvider, ValidationResult};
use crate::prompts::{PromptError, PromptLoader};
use crate::providers::{GenerateConfig, OutputFormat, Provider, ProviderError};
use crate::schema::{SchemaConverter, SchemaError};
use serde_json::Value;
use thiserror::Error;

const REFUSAL_PHRASES: &[&str] = &[
    "i'm sorry, i cannot",
    "i apologize, but i cannot",
    "i cannot assist with",
    "i am unable to",
    "i must decline",
];

fn looks_like_refusal(text: &str) -> bool {
    let lower = text.to_lowercase();
    REFUSAL_PHRASES.iter().any(|phrase| lower.contains(phrase))
}

struct FieldRelationship {
    field: &'static str,
    parent: &'static str,
    target: &'static str,
    description: &'static str,
}

const FIELD_RELATIONSHIPS: &[FieldRelationship] = &[
    FieldRelationship {
        field: "organization",
        parent: "none",
        target: "organization",
        description: "the service provider entity",
    },
    FieldRelationship {
        field: "services",
        parent: "organization",
        target: "service",
        description: "a specific service offered by the organization",
    },
    FieldRelationship {
        field: "locations",
        parent: "organization",
        target: "location",
        description: "a physical or virtual place where services are delivered",
    },
    FieldRelationship {
        field: "phones",
        parent: "service|location",
        target: "phone",
        description: "a contact number",
    },
    FieldRelationship {
        field: "addresses",
        parent: "location",
        target: "address",
        description: "a physical address",
    },
];

fn relationship_for(field: &str) -> Option<&'static FieldRelationship> {
    let head = field.split(['.', '[']).next().unwrap_or(field);
    FIELD_RELATIONSHIPS.iter().find(|r| r.field == head)
}

#[derive(Debug, Error)]
pub enum AlignError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("model refused to respond")]
    Refused,

    #[error(
        "alignment failed after {attempts} attempt(s), final confidence {final_confidence:.3}: {reason}"
    )]
    Exhausted {
        attempts: usize,
        final_confidence: f64,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, AlignError>;

#[derive(Debug, Clone)]
pub struct Attempt {
    pub index: usize,
    pub prompt: String,
    pub raw_response: String,
    pub cleaned_response: Option<Value>,
    pub is_valid: bool,
    pub feedback: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct AlignedPayload {
    pub hsds_data: Value,
    pub confidence_score: f64,
    pub validation: ValidationResult,
    pub attempts: Vec<Attempt>,
}

pub struct HsdsAligner<'a> {
    provider: &'a dyn Provider,
    judge: &'a ValidationProvider<'a>,
    prompts: &'a PromptLoader,
    schema: &'a SchemaConverter,
    config: ValidationConfig,
}

impl<'a> HsdsAligner<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        judge: &'a ValidationProvider<'a>,
        prompts: &'a PromptLoader,
        schema: &'a SchemaConverter,
        config: ValidationConfig,
    ) -> Self {
        Self { provider, judge, prompts, schema, config }
    }

    pub async fn align(&self, raw_input: &str, known_fields: Option<&KnownFields>) -> Result<AlignedPayload> {
        let system_prompt = self.prompts.aligner_prompt()?;
        let format = self.format()?;

        let mut attempts: Vec<Attempt> = Vec::new();
        let mut feedback: Option<String> = None;

        for index in 0..self.config.max_retries {
            let prompt = self.build_prompt(system_prompt, raw_input, feedback.as_deref());
            let generate_config = GenerateConfig {
                temperature: Some(0.7),
                max_tokens: Some(64768),
                format: Some(format.clone()),
                ..Default::default()
            };

            let is_last_attempt = index + 1 == self.config.max_retries;

            let outcome = self.run_attempt(&prompt, &format, &generate_config, raw_input, known_fields).await;

            match outcome {
                Ok((hsds_data, validation)) => {
                    let score = validation.confidence;
                    attempts.push(Attempt {
                        index,
                        prompt: prompt.clone(),
                        raw_response: serde_json::to_string(&hsds_data).unwrap_or_default(),
                        cleaned_response: Some(hsds_data.clone()),
                        is_valid: score >= self.config.min_confidence,
                        feedback: validation.feedback.clone(),
                        score,
                    });

                    if score >= self.config.min_confidence {
                        return Ok(AlignedPayload {
                            hsds_data,
                            confidence_score: score,
                            validation,
                            attempts,
                        });
                    }

                    if is_last_attempt {
                        return Err(AlignError::Exhausted {
                            attempts: attempts.len(),
                            final_confidence: score,
                            reason: validation.feedback.clone().unwrap_or_else(|| "confidence below threshold".to_string()),
                        });
                    }

                    feedback = Some(self.build_feedback(&validation, score));
                }
                Err(AttemptFailure::Refused) => {
                    attempts.push(Attempt {
                        index,
                        prompt: prompt.clone(),
                        raw_response: String::new(),
                        cleaned_response: None,
                        is_valid: false,
                        feedback: Some("Model refused to generate. Adjusting prompt.".to_string()),
                        score: 0.0,
                    });

                    if is_last_attempt {
                        return Err(AlignError::Refused);
                    }
                    feedback = Some("Model refused to generate. Adjusting prompt.".to_string());
                }
                Err(AttemptFailure::ParseError(message)) => {
                    attempts.push(Attempt {
                        index,
                        prompt: prompt.clone(),
                        raw_response: String::new(),
                        cleaned_response: None,
                        is_valid: false,
                        feedback: Some(message.clone()),
                        score: 0.0,
                    });

                    if is_last_attempt {
                        return Err(AlignError::Exhausted {
                            attempts: attempts.len(),
                            final_confidence: 0.0,
                            reason: message,
                        });
                    }
                    feedback = Some(message);
                }
                Err(AttemptFailure::Hard(err)) => {
                    if is_last_attempt {
                        return Err(err);
                    }
                    let message = err.to_string();
                    attempts.push(Attempt {
                        index,
                        prompt: prompt.clone(),
                        raw_response: String::new(),
                        cleaned_response: None,
                        is_valid: false,
                        feedback: Some(message.clone()),
                        score: 0.0,
                    });
                    feedback = Some(message);
                }
            }
        }

        unreachable!("loop always returns on its last iteration")
    }

    async fn run_attempt(
        &self,
        prompt: &str,
        format: &OutputFormat,
        config: &GenerateConfig,
        raw_input: &str,
        known_fields: Option<&KnownFields>,
    ) -> std::result::Result<(Value, ValidationResult), AttemptFailure> {
        reject_streaming(config).map_err(|e| AttemptFailure::Hard(AlignError::Validation(e)))?;

        let response = self
            .provider
            .generate(prompt, Some(format), Some(config))
            .await
            .map_err(|e| AttemptFailure::Hard(AlignError::Provider(e)))?;

        if looks_like_refusal(&response.text) {
            return Err(AttemptFailure::Refused);
        }

        let hsds_data = match &response.parsed {
            Some(value) => value.clone(),
            None => serde_json::from_str::<Value>(&response.text)
                .map_err(|e| AttemptFailure::ParseError(e.to_string()))?,
        };

        let validation = self
            .judge
            .validate(raw_input, &hsds_data, known_fields)
            .await
            .map_err(|e| AttemptFailure::Hard(AlignError::Validation(e)))?;

        Ok((hsds_data, validation))
    }

    fn format(&self) -> Result<OutputFormat> {
        Ok(self.schema.convert_to_llm_schema("top_level")?)
    }

    fn build_prompt(&self, system_prompt: &str, raw_input: &str, feedback: Option<&str>) -> String {
        let mut prompt = format!("{system_prompt}\n\nInput Data:\n{raw_input}");
        if let Some(feedback) = feedback {
            prompt.push_str("\n\n");
            prompt.push_str(&self.annotate_feedback(feedback));
        }
        prompt
    }

    fn annotate_feedback(&self, feedback: &str) -> String {
        let mut lines = vec!["Feedback from previous attempt:".to_string(), feedback.to_string()];
        for line in feedback.lines() {
            if let Some(field) = extract_field_name(line) {
                if let Some(rel) = relationship_for(&field) {
                    lines.push(format!(
                        "Note on '{field}': parent={}, target={}, description={}",
                        rel.parent, rel.target, rel.description
                    ));
                }
            }
        }
        lines.join("\n")
    }

    fn build_feedback(&self, validation: &ValidationResult, _score: f64) -> String {
        let mut parts = Vec::new();
        if let Some(feedback) = &validation.feedback {
            if !feedback.is_empty() {
                parts.push(feedback.clone());
            }
        }
        if validation.hallucination_detected {
            parts.push("Remove any hallucinated data not present in input".to_string());
        }
        if let Some(mismatched) = &validation.mismatched_fields {
            if !mismatched.is_empty() {
                parts.push(format!("Fix mismatched fields: {}", mismatched.join(", ")));
            }
        }
        parts.join("\n")
    }
}

enum AttemptFailure {
    Refused,
    ParseError(String),
    Hard(AlignError),
}

fn extract_field_name(feedback_line: &str) -> Option<String> {
    let start = feedback_line.find('\'')?;
    let rest = &feedback_line[start + 1..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{LlmResponse, TokenUsage};
    use crate::schema::SchemaConverter;
    use async_trait::async_trait;
    use std::io::Write;
    use tempfile::NamedTempFile;

    struct PanicsIfCalledProvider;

    #[async_trait]
    impl Provider for PanicsIfCalledProvider {
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
            panic!("provider should not be called for a streaming request");
        }
    }

    fn write_schema() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(
            b"table_name,field_name,field_type,required,unique,enumeration,reference\n\
              top_level,organization,array,true,false,,organization\n\
              organization,name,string,true,false,,\n",
        )
        .unwrap();
        file
    }

    #[tokio::test]
    async fn streaming_config_short_circuits_before_the_provider_is_called() {
        let provider = PanicsIfCalledProvider;
        let prompts = PromptLoader::new(None, None);
        let judge = ValidationProvider::new(&provider, ValidationConfig::default(), &prompts);
        let schema_file = write_schema();
        let schema = SchemaConverter::new(schema_file.path());
        let aligner = HsdsAligner::new(&provider, &judge, &prompts, &schema, ValidationConfig::default());

        let format = aligner.format().unwrap();
        let config = GenerateConfig { stream: true, ..Default::default() };

        let result = aligner.run_attempt("prompt", &format, &config, "raw", None).await;

        assert!(matches!(
            result,
            Err(AttemptFailure::Hard(AlignError::Validation(ValidationError::Streaming)))
        ));
    }

    #[test]
    fn refusal_phrases_are_detected_case_insensitively() {
        assert!(looks_like_refusal("I'm Sorry, I Cannot help with that."));
        assert!(looks_like_refusal("i must decline this request"));
        assert!(!looks_like_refusal("here is the structured data"));
    }

    #[test]
    fn relationship_lookup_matches_field_head() {
        let rel = relationship_for("services[0].name").unwrap();
        assert_eq!(rel.target, "service");
    }

    #[test]
    fn field_name_extraction_reads_quoted_token() {
        assert_eq!(
            extract_field_name("Missing required field 'organization.name'"),
            Some("organization.name".to_string())
        );
        assert_eq!(extract_field_name("no quotes here"), None);
    }
}
