//! Loads the aligner's system prompt and the validator's judge-prompt
//! template from disk, caching each once per process.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

const DEFAULT_ALIGNER_PROMPT: &str = include_str!("../../resources/prompts/food_pantry_mapper.prompt");
const DEFAULT_VALIDATION_PROMPT: &str = include_str!("../../resources/prompts/validation_prompt.prompt");

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("unable to read prompt file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PromptError>;

pub struct PromptLoader {
    aligner_path: Option<PathBuf>,
    validation_path: Option<PathBuf>,
    aligner: OnceLock<String>,
    validation: OnceLock<String>,
}

impl PromptLoader {
    pub fn new(aligner_path: Option<PathBuf>, validation_path: Option<PathBuf>) -> Self {
        Self {
            aligner_path,
            validation_path,
            aligner: OnceLock::new(),
            validation: OnceLock::new(),
        }
    }

    pub fn aligner_prompt(&self) -> Result<&str> {
        if let Some(cached) = self.aligner.get() {
            return Ok(cached);
        }
        let text = load_or_default(self.aligner_path.as_deref(), DEFAULT_ALIGNER_PROMPT)?;
        Ok(self.aligner.get_or_init(|| text))
    }

    pub fn validation_prompt(&self) -> Result<&str> {
        if let Some(cached) = self.validation.get() {
            return Ok(cached);
        }
        let text = load_or_default(self.validation_path.as_deref(), DEFAULT_VALIDATION_PROMPT)?;
        Ok(self.validation.get_or_init(|| text))
    }
}

fn load_or_default(path: Option<&Path>, default: &str) -> Result<String> {
    match path {
        Some(path) if path.exists() => std::fs::read_to_string(path).map_err(|source| PromptError::Read {
            path: path.display().to_string(),
            source,
        }),
        _ => Ok(default.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_embedded_default_when_no_path_configured() {
        let loader = PromptLoader::new(None, None);
        assert!(loader.aligner_prompt().unwrap().contains("HSDS"));
        assert!(loader.validation_prompt().unwrap().contains("{input_data}"));
    }

    #[test]
    fn reads_and_caches_from_disk_when_present() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.prompt");
        std::fs::write(&path, "custom prompt body").unwrap();
        let loader = PromptLoader::new(Some(path), None);
        assert_eq!(loader.aligner_prompt().unwrap(), "custom prompt body");
    }
}
