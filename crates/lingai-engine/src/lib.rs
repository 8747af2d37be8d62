//! Compute engine boundary.
//!
//! The worker never does numeric work itself; it drives an implementation of
//! [`ComputeEngine`]. Every operation may suspend for an arbitrary time and may
//! fail with an [`EngineError`].

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use lingai_types::ModelConfig;

pub mod simulated;
mod tokens;

pub use simulated::SimulatedEngine;
pub use tokens::count_tokens;

/// Failure reported by an engine, surfaced to hosts verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct EngineError {
    /// Engine-specific machine-readable code.
    pub code: String,
    pub message: String,
}

impl EngineError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Lazy, finite, non-restartable sequence of generated text fragments.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, EngineError>> + Send>>;

/// Metadata an engine reports after loading a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelDetails {
    pub name: Option<String>,
    pub context_length: Option<u32>,
    pub embedding_dimensions: Option<usize>,
}

#[async_trait]
pub trait ComputeEngine: Send + Sync {
    async fn load(&self, path: &str, config: &ModelConfig) -> Result<ModelDetails, EngineError>;

    async fn unload(&self) -> Result<(), EngineError>;

    async fn infer(&self, prompt: &str, config: &ModelConfig) -> Result<String, EngineError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError>;

    /// Start a streaming generation. Errors before the first fragment are
    /// returned here; later ones arrive as stream items.
    async fn stream_infer(
        &self,
        prompt: &str,
        config: &ModelConfig,
    ) -> Result<FragmentStream, EngineError>;

    /// Rough token count used for usage reporting.
    fn count_tokens(&self, text: &str) -> u32 {
        count_tokens(text)
    }
}
