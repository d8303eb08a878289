//! Pipeline facade
//!
//! Stable entry point wrapping the backend for embedders of the engine:
//! builds both providers from a single [`RagConfig`], answers queries with
//! timing splits and retrieved-chunk attributions, and exposes index
//! persistence. The generator backend is chosen by model file extension:
//! `.gguf` runs on the llama runtime, anything else on the ONNX decoder.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backend::RagBackend;
use crate::config::RagConfig;
use crate::embedding::{OnnxEmbeddingConfig, OnnxEmbeddingProvider};
use crate::error::{RagError, Result};
use crate::generation::{GenerationError, GenerationOptions, OnnxGeneratorConfig, OnnxTextGenerator, TextGenerator};

#[cfg(feature = "gguf")]
use crate::generation::{LlamaGeneratorConfig, LlamaTextGenerator};

/// Per-query parameters; zero values fall back to the engine defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: usize,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
        }
    }
}

/// One retrieved chunk with its attribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub text: String,
    pub similarity_score: f32,
    pub metadata: serde_json::Value,
}

/// Full query answer with timing breakdown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOutput {
    pub answer: String,
    pub context_used: Option<String>,
    pub retrieval_time_ms: f64,
    pub generation_time_ms: f64,
    pub total_time_ms: f64,
    pub retrieved_chunks: Vec<RetrievedChunk>,
}

/// Owned, ready-to-use RAG pipeline.
///
/// Construction fails fast: no pipeline is returned unless both providers
/// initialized completely.
pub struct RagPipeline {
    backend: RagBackend,
    #[cfg(feature = "gguf")]
    llama_generator: Option<Arc<LlamaTextGenerator>>,
}

impl RagPipeline {
    pub fn new(config: RagConfig) -> Result<Self> {
        config.validate()?;

        let embedding_config = match &config.embedding.config_json {
            Some(json) => serde_json::from_str::<OnnxEmbeddingConfig>(json).map_err(|e| {
                RagError::Json {
                    source: e,
                    context: "parsing embedding config_json".to_string(),
                }
            })?,
            None => OnnxEmbeddingConfig {
                vocab_path: config.embedding.vocab_path.clone(),
                max_seq_length: config.embedding.max_seq_length,
                dimension: config.embedding.dimension,
                ..OnnxEmbeddingConfig::default()
            },
        };

        let embedding_provider = Arc::new(OnnxEmbeddingProvider::new(
            &config.embedding.model_path,
            embedding_config,
        )?);

        let is_gguf = config
            .generator
            .model_path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"));

        #[cfg(not(feature = "gguf"))]
        if is_gguf {
            return Err(RagError::Config(
                "GGUF model configured but the gguf feature is not compiled in".to_string(),
            ));
        }

        #[cfg(feature = "gguf")]
        let llama_generator = if is_gguf {
            let generator_config = match &config.generator.config_json {
                Some(json) => serde_json::from_str::<LlamaGeneratorConfig>(json).map_err(|e| {
                    RagError::Json {
                        source: e,
                        context: "parsing generator config_json".to_string(),
                    }
                })?,
                None => LlamaGeneratorConfig {
                    context_size: config.generator.context_size,
                    batch_size: config.generator.batch_size,
                    ..LlamaGeneratorConfig::default()
                },
            };
            Some(Arc::new(LlamaTextGenerator::new(
                &config.generator.model_path,
                generator_config,
            )?))
        } else {
            None
        };

        let build_onnx_generator = || -> Result<Arc<OnnxTextGenerator>> {
            let generator_config = match &config.generator.config_json {
                Some(json) => serde_json::from_str::<OnnxGeneratorConfig>(json).map_err(|e| {
                    RagError::Json {
                        source: e,
                        context: "parsing generator config_json".to_string(),
                    }
                })?,
                None => OnnxGeneratorConfig {
                    max_context_length: config.generator.context_size,
                    tokenizer_path: config.generator.tokenizer_path.clone(),
                    ..OnnxGeneratorConfig::default()
                },
            };
            Ok(Arc::new(OnnxTextGenerator::new(
                &config.generator.model_path,
                generator_config,
            )?))
        };

        #[cfg(feature = "gguf")]
        let text_generator: Arc<dyn TextGenerator> = match &llama_generator {
            Some(generator) => Arc::clone(generator) as Arc<dyn TextGenerator>,
            None => build_onnx_generator()? as Arc<dyn TextGenerator>,
        };

        #[cfg(not(feature = "gguf"))]
        let text_generator: Arc<dyn TextGenerator> =
            build_onnx_generator()? as Arc<dyn TextGenerator>;

        let backend = RagBackend::new(
            config.backend.clone(),
            Some(embedding_provider),
            Some(text_generator),
        )?;

        tracing::info!("RAG pipeline created");
        Ok(Self {
            backend,
            #[cfg(feature = "gguf")]
            llama_generator,
        })
    }

    /// Ingest a document, optionally with a JSON metadata object. Returns
    /// the number of chunks indexed.
    pub fn add_document(&self, text: &str, metadata_json: Option<&str>) -> Result<usize> {
        let metadata = match metadata_json {
            Some(json) => serde_json::from_str(json).map_err(|e| RagError::Json {
                source: e,
                context: "parsing document metadata".to_string(),
            })?,
            None => serde_json::Value::Null,
        };
        self.backend.add_document(text, metadata)
    }

    /// Answer a question over the ingested documents
    pub fn query(&self, question: &str, params: &QueryParams) -> Result<QueryOutput> {
        let options = GenerationOptions {
            max_tokens: if params.max_tokens > 0 {
                params.max_tokens
            } else {
                512
            },
            temperature: if params.temperature > 0.0 {
                params.temperature
            } else {
                0.7
            },
            top_p: if params.top_p > 0.0 { params.top_p } else { 0.9 },
            top_k: if params.top_k > 0 { params.top_k } else { 40 },
            stop_sequences: Vec::new(),
        };

        let start = Instant::now();
        let result = self.backend.query(question, &options);
        let total_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        if !result.success {
            return Err(GenerationError::Failed(result.text).into());
        }

        let retrieved_chunks = result.metadata["sources"]
            .as_array()
            .map(|sources| {
                sources
                    .iter()
                    .map(|source| RetrievedChunk {
                        chunk_id: source["id"].as_str().unwrap_or_default().to_string(),
                        text: source["text"].as_str().unwrap_or_default().to_string(),
                        similarity_score: source["score"].as_f64().unwrap_or(0.0) as f32,
                        metadata: source["metadata"].clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let context_used = result.metadata["context_length"]
            .as_u64()
            .map(|n| format!("Context length: {n}"));

        let generation_time_ms = result.inference_time_ms;

        Ok(QueryOutput {
            answer: result.text,
            context_used,
            retrieval_time_ms: (total_time_ms - generation_time_ms).max(0.0),
            generation_time_ms,
            total_time_ms,
            retrieved_chunks,
        })
    }

    /// Retrieval only: top-K similar chunks for a query, no generation
    pub fn search(&self, query: &str, top_k: usize) -> Result<Vec<crate::store::SearchResult>> {
        self.backend.search(query, top_k)
    }

    /// Drop all ingested documents
    pub fn clear_documents(&self) {
        self.backend.clear();
    }

    pub fn document_count(&self) -> usize {
        self.backend.document_count()
    }

    pub fn statistics(&self) -> serde_json::Value {
        self.backend.get_statistics()
    }

    /// Request cooperative cancellation of an in-flight GGUF generation.
    /// The ONNX decoder runs to completion once started.
    #[cfg(feature = "gguf")]
    pub fn cancel_generation(&self) {
        if let Some(generator) = &self.llama_generator {
            generator.cancel();
        }
    }

    pub fn save_index(&self, path: &Path) -> Result<()> {
        self.backend.save_index(path)
    }

    pub fn load_index(&self, path: &Path) -> Result<()> {
        self.backend.load_index(path)
    }
}
