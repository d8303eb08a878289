//! Configuration management
//!
//! Loading, validation, and defaults for the engine configuration. The
//! top-level [`RagConfig`] is TOML-loadable and feeds the pipeline facade;
//! component configs live next to their components and are validated
//! fail-fast at construction time.

use crate::backend::RagBackendConfig;
use crate::error::{RagError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

mod validator;

pub use validator::{validate_backend, ConfigValidator, ValidationError};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub embedding: EmbeddingSettings,
    pub generator: GeneratorSettings,
    pub backend: RagBackendConfig,
}

/// Embedding model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSettings {
    /// Path to the ONNX embedding model
    pub model_path: PathBuf,
    /// Vocabulary file; defaults to `vocab.txt` beside the model
    pub vocab_path: Option<PathBuf>,
    pub max_seq_length: usize,
    pub dimension: usize,
    /// Provider-specific configuration as a JSON string
    pub config_json: Option<String>,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            vocab_path: None,
            max_seq_length: 512,
            dimension: 384,
            config_json: None,
        }
    }
}

/// Generation model settings. The generator backend is chosen by file
/// extension: `.gguf` models run on the llama runtime, anything else on the
/// ONNX decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorSettings {
    /// Path to the generation model (GGUF or ONNX)
    pub model_path: PathBuf,
    /// Optional tokenizer file for the ONNX decoder
    pub tokenizer_path: Option<PathBuf>,
    pub context_size: usize,
    pub batch_size: usize,
    /// Provider-specific configuration as a JSON string
    pub config_json: Option<String>,
}

impl Default for GeneratorSettings {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            tokenizer_path: None,
            context_size: 2048,
            batch_size: 64,
            config_json: None,
        }
    }
}

impl RagConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RagError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| RagError::Io {
            source: e,
            context: format!("reading config {}", path.display()),
        })?;

        let config: RagConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Validate, returning all problems at once
    pub fn validate(&self) -> Result<()> {
        let errors = ConfigValidator::validate(self);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RagError::ConfigValidation { errors })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_are_valid_except_model_paths() {
        let config = RagConfig::default();
        let errors = ConfigValidator::validate(&config);
        assert!(errors.iter().all(|e| e.path.contains("model_path")));
    }

    #[test]
    fn load_parses_partial_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[embedding]
model_path = "/models/minilm.onnx"
dimension = 384

[generator]
model_path = "/models/tiny.gguf"

[backend]
top_k = 5
chunk_size = 256
"#
        )
        .unwrap();
        file.flush().unwrap();

        let config = RagConfig::load(file.path()).unwrap();
        assert_eq!(config.backend.top_k, 5);
        assert_eq!(config.backend.chunk_size, 256);
        assert_eq!(config.backend.chunk_overlap, 50);
        assert_eq!(
            config.embedding.model_path,
            PathBuf::from("/models/minilm.onnx")
        );
    }

    #[test]
    fn missing_file_is_config_not_found() {
        let err = RagConfig::load(Path::new("/nonexistent/ragmill.toml")).unwrap_err();
        assert!(matches!(err, RagError::ConfigNotFound { .. }));
    }
}
