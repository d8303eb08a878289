//! Text generation
//!
//! Two interchangeable backends produce an answer string from a prompt:
//! one drives a causal ONNX model with hand-rolled autoregressive decoding
//! and explicit KV-cache carry-over, the other delegates to a GGUF model
//! runtime. Both implement [`TextGenerator`].

#[cfg(feature = "onnx")]
mod onnx;
#[cfg(feature = "onnx")]
mod sampling;

#[cfg(feature = "gguf")]
mod llama;

#[cfg(feature = "onnx")]
pub use onnx::{OnnxGeneratorConfig, OnnxTextGenerator};

#[cfg(feature = "gguf")]
pub use llama::{LlamaGeneratorConfig, LlamaTextGenerator};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Model initialization failed: {0}")]
    InitializationError(String),

    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Tokenization failed: {0}")]
    Tokenize(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Prompt of {prompt_tokens} tokens exceeds context of {context_size}")]
    PromptTooLong {
        prompt_tokens: usize,
        context_size: usize,
    },

    #[error("Generator worker is gone")]
    WorkerGone,

    #[error("Generation failed: {0}")]
    Failed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which condition ended a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// An end-of-sequence token was sampled
    Stop,
    /// `max_tokens` was reached
    Length,
    /// A configured stop sequence appeared in the output
    StopSequence,
    /// Cooperative cancellation was requested
    Cancelled,
    /// Generation aborted on an error
    Error,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::Stop => "stop",
            StopReason::Length => "length",
            StopReason::StopSequence => "stop_sequence",
            StopReason::Cancelled => "cancelled",
            StopReason::Error => "error",
        };
        f.write_str(s)
    }
}

/// Sampling and length parameters for one generation call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
    /// Generation stops as soon as any of these appears in the output
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            stop_sequences: Vec::new(),
        }
    }
}

/// Generation outcome with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_generated: usize,
    pub prompt_tokens: usize,
    pub inference_time_ms: f64,
    pub finished: bool,
    pub stop_reason: StopReason,
    /// Arbitrary bag for source attribution and diagnostics
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub success: bool,
}

impl GenerationResult {
    /// Well-formed failure result; queries after a transient failure keep
    /// working because nothing is thrown past this boundary.
    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_generated: 0,
            prompt_tokens: 0,
            inference_time_ms: 0.0,
            finished: false,
            stop_reason: StopReason::Error,
            metadata: serde_json::Value::Null,
            success: false,
        }
    }
}

/// Trait for text generators
///
/// `generate` blocks for the duration of inference and may take seconds;
/// callers bring their own threads.
pub trait TextGenerator: Send + Sync {
    /// Generate text from a prompt
    fn generate(&self, prompt: &str, options: &GenerationOptions) -> GenerationResult;

    /// Check whether the generator is ready for inference
    fn is_ready(&self) -> bool;

    /// Generator name for logging and diagnostics
    fn name(&self) -> &str;

    /// Maximum context size in tokens
    fn context_size(&self) -> usize;
}
