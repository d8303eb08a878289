use std::path::PathBuf;
use thiserror::Error;

use crate::config::ValidationError;

/// Main error type for the ragmill engine
#[derive(Error, Debug)]
pub enum RagError {
    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration validation errors
    #[error("Configuration validation failed: {errors:?}")]
    ConfigValidation { errors: Vec<ValidationError> },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound { path: PathBuf },

    /// Embedding provider errors
    #[error("Embedding error: {0}")]
    Embedding(#[from] crate::embedding::EmbeddingError),

    /// Text generation errors
    #[error("Generation error: {0}")]
    Generation(#[from] crate::generation::GenerationError),

    /// Vector store errors
    #[error("Vector store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Provider required for an operation is missing or not ready
    #[error("{0} is not available")]
    ProviderNotReady(&'static str),

    /// IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    /// TOML deserialization errors
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// JSON errors
    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },

    /// Generic errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for ragmill operations
pub type Result<T> = std::result::Result<T, RagError>;
