//! Text generation for taskmesh.
//!
//! Two call sites: the orchestrator breaks a project description into task
//! bullets, and each worker runtime executes a task by prompting the model
//! with its description. Backends:
//! - **Ollama**: local HTTP API, the default (model `mistral`)
//! - **Anthropic** / **OpenAI**: direct API access via rig-core

mod ollama;
mod rig_backend;

pub use ollama::OllamaGenerator;
pub use rig_backend::RigGenerator;

use std::sync::Arc;

use async_trait::async_trait;
use secrecy::SecretString;

use crate::error::{ConfigError, GenerateError};

/// A text-in, text-out model backend.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Run one prompt to completion and return the response text.
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError>;

    /// Cheap connectivity probe for health reporting. Hosted backends have
    /// nothing to probe without spending tokens, so the default passes.
    async fn check(&self) -> Result<(), GenerateError> {
        Ok(())
    }

    fn model_name(&self) -> &str;

    fn provider_name(&self) -> &str;
}

/// Supported generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerateBackend {
    Ollama,
    Anthropic,
    OpenAi,
}

impl std::str::FromStr for GenerateBackend {
    type Err = GenerateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ollama" => Ok(Self::Ollama),
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            other => Err(GenerateError::UnknownBackend(other.to_string())),
        }
    }
}

/// Configuration for creating a generator.
#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub backend: GenerateBackend,
    pub model: String,
    /// API key for hosted backends. Unused by Ollama.
    pub api_key: Option<SecretString>,
    /// Base URL of the Ollama server.
    pub ollama_url: String,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            backend: GenerateBackend::Ollama,
            model: "mistral".to_string(),
            api_key: None,
            ollama_url: "http://localhost:11434".to_string(),
        }
    }
}

impl GenerateConfig {
    /// Hosted backends require their key variable; a missing key is a
    /// startup error rather than a failure on the first prompt.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let backend = match std::env::var("TASKMESH_LLM_BACKEND") {
            Ok(s) => s.parse().map_err(|e: GenerateError| ConfigError::InvalidValue {
                key: "TASKMESH_LLM_BACKEND".to_string(),
                message: e.to_string(),
            })?,
            Err(_) => defaults.backend,
        };

        let api_key = match backend {
            GenerateBackend::Ollama => None,
            GenerateBackend::Anthropic => Some(require_env("ANTHROPIC_API_KEY")?),
            GenerateBackend::OpenAi => Some(require_env("OPENAI_API_KEY")?),
        }
        .map(SecretString::from);

        Ok(Self {
            backend,
            model: std::env::var("TASKMESH_LLM_MODEL").unwrap_or(defaults.model),
            api_key,
            ollama_url: std::env::var("TASKMESH_OLLAMA_URL").unwrap_or(defaults.ollama_url),
        })
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Create a generator from configuration.
pub fn create_generator(config: &GenerateConfig) -> Result<Arc<dyn Generator>, GenerateError> {
    match config.backend {
        GenerateBackend::Ollama => Ok(Arc::new(OllamaGenerator::new(
            &config.ollama_url,
            &config.model,
        ))),
        GenerateBackend::Anthropic => rig_backend::create_anthropic(config),
        GenerateBackend::OpenAi => rig_backend::create_openai(config),
    }
}

/// Prompt asking the model to carry out one task.
pub fn execution_prompt(description: &str) -> String {
    format!("Execute this task and provide the result:\nTask: {description}")
}

/// Prompt asking the model to break a project into tasks.
pub fn breakdown_prompt(name: &str, description: &str) -> String {
    format!(
        "Analyze this project and break it down into tasks:\nName: {name}\nDescription: {description}"
    )
}

/// Pull task descriptions out of a breakdown response.
///
/// The contract with the model is one `- ` bullet per task; everything else
/// (prose, numbering, blank lines) is ignored.
pub fn parse_task_lines(response: &str) -> Vec<String> {
    response
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let task = line.strip_prefix('-')?.trim();
            (!task.is_empty()).then(|| task.to_string())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_parse() {
        assert_eq!(
            "ollama".parse::<GenerateBackend>().unwrap(),
            GenerateBackend::Ollama
        );
        assert!(matches!(
            "mistral".parse::<GenerateBackend>(),
            Err(GenerateError::UnknownBackend(_))
        ));
    }

    #[test]
    fn parse_task_lines_keeps_only_bullets() {
        let response = "\
Here is the breakdown:

- Design the schema
- Implement the API
  - Write integration tests

That should cover it.";
        let tasks = parse_task_lines(response);
        assert_eq!(
            tasks,
            vec![
                "Design the schema",
                "Implement the API",
                "Write integration tests"
            ]
        );
    }

    #[test]
    fn parse_task_lines_skips_empty_bullets() {
        assert!(parse_task_lines("-\n- \nno bullets here").is_empty());
    }

    #[test]
    fn execution_prompt_embeds_description() {
        let p = execution_prompt("sort the inbox");
        assert!(p.contains("Task: sort the inbox"));
    }
}
