//! Ollama backend over the plain HTTP generate API.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::GenerateError;
use crate::generate::Generator;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

pub struct OllamaGenerator {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
        };

        let response = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.client
                .post(format!("{}/api/generate", self.base_url))
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| GenerateError::RequestFailed {
            provider: "ollama".to_string(),
            reason: "request timed out".to_string(),
        })?
        .map_err(|e| GenerateError::RequestFailed {
            provider: "ollama".to_string(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerateError::RequestFailed {
                provider: "ollama".to_string(),
                reason: format!("HTTP {status}: {body}"),
            });
        }

        let parsed: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| GenerateError::InvalidResponse {
                    provider: "ollama".to_string(),
                    reason: e.to_string(),
                })?;

        debug!(model = %self.model, chars = parsed.response.len(), "Ollama generation complete");
        Ok(parsed.response)
    }

    /// Probe the server's model listing endpoint.
    async fn check(&self) -> Result<(), GenerateError> {
        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| GenerateError::RequestFailed {
                provider: "ollama".to_string(),
                reason: e.to_string(),
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GenerateError::RequestFailed {
                provider: "ollama".to_string(),
                reason: format!("HTTP {}", response.status()),
            })
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn provider_name(&self) -> &str {
        "ollama"
    }
}
