//! Embedding adapter: cached, dimension-checked lookups.
//!
//! One adapter instance serves one session. Embeddings are cached by turn
//! index so a turn is never embedded twice, even across retries, and the
//! first successful embedding pins the session's vector dimension. A
//! backend failure is reported as a recoverable condition; the caller
//! decides whether to retry or escalate.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::backend::EmbeddingBackend;
use crate::error::{BackendError, EngineError};

/// Sentinel meaning "no dimension pinned yet".
const DIM_UNSET: usize = 0;

/// Session-scoped embedding adapter.
pub struct EmbeddingAdapter {
    backend: Arc<dyn EmbeddingBackend>,
    cache: DashMap<usize, Arc<Vec<f32>>>,
    dimension: AtomicUsize,
}

impl EmbeddingAdapter {
    pub fn new(backend: Arc<dyn EmbeddingBackend>) -> Self {
        Self {
            backend,
            cache: DashMap::new(),
            dimension: AtomicUsize::new(DIM_UNSET),
        }
    }

    /// The pinned embedding dimension, if any turn has been embedded.
    pub fn dimension(&self) -> Option<usize> {
        match self.dimension.load(Ordering::Acquire) {
            DIM_UNSET => None,
            d => Some(d),
        }
    }

    /// Embed the text for `turn_index`, or return the cached vector.
    ///
    /// Backend failures come back as `BackendError` (the "not yet
    /// embeddable" condition); a dimension mismatch against the pinned
    /// session dimension is a hard `DataIntegrity` error.
    pub async fn embed_turn(
        &self,
        turn_index: usize,
        text: &str,
    ) -> Result<Arc<Vec<f32>>, EngineError> {
        if let Some(hit) = self.cache.get(&turn_index) {
            return Ok(hit.clone());
        }

        let vector = self
            .backend
            .embed(text)
            .await
            .map_err(|source| EngineError::TransientBackend {
                source,
                attempts: 1,
            })?;

        if vector.is_empty() {
            return Err(EngineError::TransientBackend {
                source: BackendError::Malformed {
                    message: "backend returned an empty embedding".to_string(),
                },
                attempts: 1,
            });
        }

        let pinned = match self.dimension.compare_exchange(
            DIM_UNSET,
            vector.len(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => vector.len(),
            Err(existing) => existing,
        };
        if pinned != vector.len() {
            return Err(EngineError::DataIntegrity {
                detail: format!(
                    "embedding dimension drifted from {pinned} to {} at turn {turn_index}",
                    vector.len()
                ),
            });
        }

        let vector = Arc::new(vector);
        self.cache.insert(turn_index, vector.clone());
        Ok(vector)
    }

    /// Number of turns embedded so far.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

// ============================================================================
// Tests
// ============================================================================
