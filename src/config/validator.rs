//! Configuration validation
//!
//! Collects every problem instead of failing on the first, so a bad config
//! file can be fixed in one pass.

use crate::backend::RagBackendConfig;

use super::RagConfig;

/// One configuration validation failure
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// Path to the configuration key that failed validation
    pub path: String,
    /// Message describing the failure
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Validates engine configuration
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &RagConfig) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if config.embedding.model_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "embedding.model_path",
                "embedding model path is required",
            ));
        }
        if config.embedding.max_seq_length < 2 {
            errors.push(ValidationError::new(
                "embedding.max_seq_length",
                "sequence length must leave room for [CLS] and [SEP]",
            ));
        }
        if config.embedding.dimension == 0 {
            errors.push(ValidationError::new(
                "embedding.dimension",
                "dimension must be greater than zero",
            ));
        }

        if config.generator.model_path.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "generator.model_path",
                "generator model path is required",
            ));
        }
        if config.generator.context_size == 0 {
            errors.push(ValidationError::new(
                "generator.context_size",
                "context size must be greater than zero",
            ));
        }
        if config.generator.batch_size == 0 {
            errors.push(ValidationError::new(
                "generator.batch_size",
                "batch size must be greater than zero",
            ));
        }

        errors.extend(validate_backend(&config.backend));
        errors
    }
}

/// Backend configuration checks, shared with `RagBackend::new`
pub fn validate_backend(config: &RagBackendConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if config.embedding_dimension == 0 {
        errors.push(ValidationError::new(
            "backend.embedding_dimension",
            "dimension must be greater than zero",
        ));
    }
    if config.top_k == 0 {
        errors.push(ValidationError::new(
            "backend.top_k",
            "top_k must be greater than zero",
        ));
    }
    if !(0.0..=1.0).contains(&config.similarity_threshold) {
        errors.push(ValidationError::new(
            "backend.similarity_threshold",
            "similarity threshold must be within [0, 1]",
        ));
    }
    if config.chunk_size == 0 {
        errors.push(ValidationError::new(
            "backend.chunk_size",
            "chunk size must be greater than zero",
        ));
    }
    // Equal or larger overlap would keep re-chunking the same span
    if config.chunk_overlap >= config.chunk_size {
        errors.push(ValidationError::new(
            "backend.chunk_overlap",
            "chunk overlap must be smaller than chunk size",
        ));
    }
    if config.max_context_tokens == 0 {
        errors.push(ValidationError::new(
            "backend.max_context_tokens",
            "context budget must be greater than zero",
        ));
    }
    if !config.prompt_template.contains("{context}") {
        errors.push(ValidationError::new(
            "backend.prompt_template",
            "prompt template must contain a {context} placeholder",
        ));
    }
    if !config.prompt_template.contains("{query}") {
        errors.push(ValidationError::new(
            "backend.prompt_template",
            "prompt template must contain a {query} placeholder",
        ));
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_backend_config_is_valid() {
        assert!(validate_backend(&RagBackendConfig::default()).is_empty());
    }

    #[test]
    fn oversized_overlap_is_rejected() {
        let config = RagBackendConfig {
            chunk_size: 64,
            chunk_overlap: 64,
            ..RagBackendConfig::default()
        };
        let errors = validate_backend(&config);
        assert!(errors.iter().any(|e| e.path == "backend.chunk_overlap"));
    }

    #[test]
    fn template_must_carry_both_placeholders() {
        let config = RagBackendConfig {
            prompt_template: "Question: {query}".to_string(),
            ..RagBackendConfig::default()
        };
        let errors = validate_backend(&config);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("{context}"));
    }

    #[test]
    fn out_of_range_threshold_is_rejected() {
        let config = RagBackendConfig {
            similarity_threshold: 1.5,
            ..RagBackendConfig::default()
        };
        let errors = validate_backend(&config);
        assert!(errors
            .iter()
            .any(|e| e.path == "backend.similarity_threshold"));
    }
}
