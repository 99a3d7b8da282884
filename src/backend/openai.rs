//! OpenAI-compatible HTTP provider.
//!
//! Implements both backend contracts against any service speaking the
//! `/chat/completions` and `/embeddings` wire shape. The base URL is
//! configurable so local inference servers work unchanged.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::backend::{
    EmbeddingBackend, GenerationBackend, GenerationOutput, GenerationRequest, TokenUsage,
};
use crate::error::BackendError;

/// Default public endpoint.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Configuration for the HTTP provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    /// Base URL without a trailing slash.
    pub base_url: String,
    /// Chat model identifier.
    pub chat_model: String,
    /// Embedding model identifier.
    pub embedding_model: String,
    /// Bearer token; falls back to `OPENAI_API_KEY` when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            chat_model: "gpt-4o-mini".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// HTTP client implementing both backend traits.
#[derive(Debug, Clone)]
pub struct OpenAiProvider {
    config: OpenAiConfig,
    client: reqwest::Client,
}

impl OpenAiProvider {
    /// Build a provider from config. Fails only if the HTTP client cannot
    /// be constructed.
    pub fn new(config: OpenAiConfig) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BackendError::Transport {
                message: e.to_string(),
            })?;
        Ok(Self { config, client })
    }

    fn api_key(&self) -> Result<String, BackendError> {
        if let Some(key) = &self.config.api_key {
            return Ok(key.clone());
        }
        std::env::var("OPENAI_API_KEY").map_err(|_| BackendError::Transport {
            message: "no api key configured and OPENAI_API_KEY unset".to_string(),
        })
    }

    async fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, BackendError> {
        let url = format!("{}{}", self.config.base_url, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key()?)
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Transport {
                message: e.to_string(),
            })?;

        let status = response.status();
        let payload: serde_json::Value =
            response.json().await.map_err(|e| BackendError::Malformed {
                message: e.to_string(),
            })?;

        if !status.is_success() {
            let message = payload
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed")
                .to_string();
            return Err(BackendError::Status {
                status: status.as_u16(),
                message,
            });
        }
        Ok(payload)
    }
}

#[async_trait]
impl GenerationBackend for OpenAiProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, BackendError> {
        let body = json!({
            "model": self.config.chat_model,
            "messages": [
                {"role": "system", "content": request.system},
                {"role": "user", "content": request.prompt},
            ],
            "temperature": request.params.temperature,
            "top_p": request.params.top_p,
            "max_tokens": request.params.max_tokens,
        });

        let started = Instant::now();
        let payload = self.post_json("/chat/completions", body).await?;
        let latency = started.elapsed();

        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| BackendError::Malformed {
                message: "response carried no message content".to_string(),
            })?
            .trim()
            .to_string();

        let usage = TokenUsage {
            prompt_tokens: payload
                .pointer("/usage/prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion_tokens: payload
                .pointer("/usage/completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };

        Ok(GenerationOutput {
            text,
            latency,
            usage,
        })
    }

    fn name(&self) -> &str {
        &self.config.chat_model
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let body = json!({
            "model": self.config.embedding_model,
            "input": text,
        });
        let payload = self.post_json("/embeddings", body).await?;

        let values = payload
            .pointer("/data/0/embedding")
            .and_then(|v| v.as_array())
            .ok_or_else(|| BackendError::Malformed {
                message: "response carried no embedding".to_string(),
            })?;

        values
            .iter()
            .map(|v| {
                v.as_f64().map(|f| f as f32).ok_or(BackendError::Malformed {
                    message: "embedding element was not a number".to_string(),
                })
            })
            .collect()
    }

    fn name(&self) -> &str {
        &self.config.embedding_model
    }
}

// ============================================================================
// Tests
// ============================================================================
