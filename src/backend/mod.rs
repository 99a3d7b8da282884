//! Backend contracts for text generation and embedding.
//!
//! The engine consumes both services as black boxes behind async traits.
//! Implementations must be cheap to clone behind an `Arc`; the scheduler
//! holds exactly one outstanding generation call per session, so providers
//! do not need their own queuing.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::SamplingParams;
use crate::error::BackendError;

pub mod openai;

/// A generation request: one fully assembled prompt plus sampling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// System-level instructions (lens, framing, dialogue rules).
    pub system: String,
    /// The user-visible prompt: provocation plus transcript window.
    pub prompt: String,
    /// Sampling parameters derived from the speaking agent's traits.
    pub params: SamplingParams,
}

/// Token accounting reported by a provider, when available.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// The outcome of a generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Generated utterance text.
    pub text: String,
    /// Wall-clock latency of the call.
    pub latency: Duration,
    /// Token accounting, zeroed if the provider does not report it.
    #[serde(default)]
    pub usage: TokenUsage,
}

/// Text-generation service consumed by the scheduler.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Generate one utterance. Providers should honor the request's
    /// sampling parameters and report true latency.
    async fn generate(&self, request: &GenerationRequest) -> Result<GenerationOutput, BackendError>;

    /// Human-readable provider name for logs and the feed.
    fn name(&self) -> &str {
        "generation"
    }
}

/// Embedding service consumed by the embedding adapter.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Embed one utterance into a fixed-dimension vector.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;

    /// Human-readable provider name for logs.
    fn name(&self) -> &str {
        "embedding"
    }
}

// ============================================================================
// Tests
// ============================================================================
