//! Embedding generation
//!
//! Providers turn text into fixed-dimension, L2-normalized float vectors.
//! The trait keeps the backend agnostic of the inference runtime; the
//! bundled implementation drives a bidirectional transformer through ONNX
//! Runtime with a WordPiece tokenizer built in.

mod tokenizer;

#[cfg(feature = "onnx")]
mod onnx;

pub use tokenizer::WordPieceTokenizer;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxEmbeddingConfig, OnnxEmbeddingProvider};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Vocabulary error: {0}")]
    Vocabulary(String),

    #[error("Embedding generation failed: {0}")]
    GenerationError(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Trait for embedding providers
///
/// Implementations must be safe to call from multiple threads after
/// construction; each `embed` call is self-contained. Inference failures
/// surface as a zero vector of the expected dimension (logged, never
/// propagated), so downstream similarity scoring degrades instead of the
/// pipeline aborting.
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding for a single text
    fn embed(&self, text: &str) -> Vec<f32>;

    /// Get the embedding dimension
    fn dimension(&self) -> usize;

    /// Check whether the provider is ready for inference
    fn is_ready(&self) -> bool;

    /// Provider name for logging and diagnostics
    fn name(&self) -> &str;
}
