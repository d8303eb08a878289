//! RAG backend orchestrator
//!
//! Wires the chunker, embedding provider, vector store, and text generator
//! together: ingest (chunk, embed, store) on the write path; embed, search,
//! build context, format prompt, generate on the read path. Thread-safe:
//! callers may search and query concurrently with provider hot-swap.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::chunker::{ChunkerConfig, DocumentChunker};
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generation::{GenerationOptions, GenerationResult, StopReason, TextGenerator};
use crate::store::{DocumentChunk, SearchResult, VectorStore, VectorStoreConfig};

/// Longest source-text preview copied into chunk metadata
const SOURCE_PREVIEW_CHARS: usize = 100;

const INSUFFICIENT_INFORMATION: &str =
    "I don't have enough information to answer that question.";

/// Backend configuration, supplied once at construction. The prompt
/// template must contain `{context}` and `{query}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RagBackendConfig {
    pub embedding_dimension: usize,
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub max_context_tokens: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub prompt_template: String,
}

impl Default for RagBackendConfig {
    fn default() -> Self {
        Self {
            embedding_dimension: 384,
            top_k: 3,
            similarity_threshold: 0.7,
            max_context_tokens: 2048,
            chunk_size: 512,
            chunk_overlap: 50,
            prompt_template: "Context:\n{context}\n\nQuestion: {query}\n\nAnswer:".to_string(),
        }
    }
}

struct SharedState {
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    text_generator: Option<Arc<dyn TextGenerator>>,
    config: RagBackendConfig,
}

/// Orchestrator over the full ingest/query pipeline.
///
/// The vector store and chunker are exclusively owned; providers are held
/// behind shared, swappable references so a hot-swap never invalidates a
/// provider out from under an in-flight call. The provider lock is held
/// only to snapshot or swap references, never across inference.
pub struct RagBackend {
    shared: Mutex<SharedState>,
    store: VectorStore,
    chunker: DocumentChunker,
    next_chunk_id: AtomicU64,
}

impl RagBackend {
    pub fn new(
        config: RagBackendConfig,
        embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
        text_generator: Option<Arc<dyn TextGenerator>>,
    ) -> Result<Self> {
        let errors = crate::config::validate_backend(&config);
        if !errors.is_empty() {
            return Err(RagError::ConfigValidation { errors });
        }

        let store = VectorStore::new(VectorStoreConfig {
            dimension: config.embedding_dimension,
            ..VectorStoreConfig::default()
        });

        let chunker = DocumentChunker::new(ChunkerConfig {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            ..ChunkerConfig::default()
        });

        tracing::info!(
            dimension = config.embedding_dimension,
            chunk_size = config.chunk_size,
            "RAG backend initialized"
        );

        Ok(Self {
            shared: Mutex::new(SharedState {
                embedding_provider,
                text_generator,
                config,
            }),
            store,
            chunker,
            next_chunk_id: AtomicU64::new(0),
        })
    }

    /// Swap the embedding provider. In-flight calls keep the provider they
    /// snapshotted; the configured dimension follows the new provider.
    pub fn set_embedding_provider(&self, provider: Arc<dyn EmbeddingProvider>) {
        let mut shared = self.shared.lock().unwrap();
        if provider.is_ready() {
            shared.config.embedding_dimension = provider.dimension();
            tracing::info!(
                provider = provider.name(),
                dimension = shared.config.embedding_dimension,
                "set embedding provider"
            );
        }
        shared.embedding_provider = Some(provider);
    }

    /// Swap the text generator
    pub fn set_text_generator(&self, generator: Arc<dyn TextGenerator>) {
        let mut shared = self.shared.lock().unwrap();
        if generator.is_ready() {
            tracing::info!(generator = generator.name(), "set text generator");
        }
        shared.text_generator = Some(generator);
    }

    /// Chunk, embed, and index a document. Returns the number of chunks
    /// actually stored; a failure on one chunk is logged and skipped rather
    /// than aborting the document.
    pub fn add_document(&self, text: &str, metadata: serde_json::Value) -> Result<usize> {
        let (provider, dimension) = {
            let shared = self.shared.lock().unwrap();
            let provider = shared
                .embedding_provider
                .clone()
                .ok_or(RagError::ProviderNotReady("embedding provider"))?;
            (provider, shared.config.embedding_dimension)
        };
        if !provider.is_ready() {
            return Err(RagError::ProviderNotReady("embedding provider"));
        }

        let chunks = self.chunker.chunk_document(text);
        tracing::info!(chunks = chunks.len(), "split document");

        let preview: String = text.chars().take(SOURCE_PREVIEW_CHARS).collect();
        let mut added = 0usize;

        for chunk in &chunks {
            let embedding = provider.embed(&chunk.text);
            if embedding.len() != dimension {
                tracing::warn!(
                    got = embedding.len(),
                    expected = dimension,
                    chunk_index = chunk.chunk_index,
                    "skipping chunk with mismatched embedding dimension"
                );
                continue;
            }

            let id = format!("chunk_{}", self.next_chunk_id.fetch_add(1, Ordering::SeqCst));
            let metadata = enrich_metadata(metadata.clone(), &preview);

            match self.store.add_chunk(DocumentChunk {
                id: id.clone(),
                text: chunk.text.clone(),
                embedding,
                metadata,
            }) {
                Ok(()) => {
                    added += 1;
                    tracing::debug!(%id, "indexed chunk");
                }
                Err(e) => tracing::warn!(%id, "failed to store chunk: {e}"),
            }
        }

        tracing::info!(added, total = chunks.len(), "document ingested");
        Ok(added)
    }

    /// Embed the query text and return the top-K similar chunks
    pub fn search(&self, query_text: &str, top_k: usize) -> Result<Vec<SearchResult>> {
        let (provider, dimension, threshold) = {
            let shared = self.shared.lock().unwrap();
            let provider = shared
                .embedding_provider
                .clone()
                .ok_or(RagError::ProviderNotReady("embedding provider"))?;
            (
                provider,
                shared.config.embedding_dimension,
                shared.config.similarity_threshold,
            )
        };
        if !provider.is_ready() {
            return Err(RagError::ProviderNotReady("embedding provider"));
        }

        let query_embedding = provider.embed(query_text);
        if query_embedding.len() != dimension {
            return Err(crate::embedding::EmbeddingError::DimensionMismatch {
                expected: dimension,
                actual: query_embedding.len(),
            }
            .into());
        }

        Ok(self.store.search(&query_embedding, top_k, threshold)?)
    }

    /// Answer a question grounded in retrieved context.
    ///
    /// Always returns a well-formed result: missing providers produce an
    /// explicit error result, and a retrieval that clears nothing above the
    /// threshold produces a canned insufficient-information answer without
    /// ever invoking the generator.
    pub fn query(&self, question: &str, options: &GenerationOptions) -> GenerationResult {
        let (provider, generator, config) = {
            let shared = self.shared.lock().unwrap();
            (
                shared.embedding_provider.clone(),
                shared.text_generator.clone(),
                shared.config.clone(),
            )
        };

        let Some(provider) = provider.filter(|p| p.is_ready()) else {
            tracing::error!("embedding provider not available for query");
            return GenerationResult::error("Error: embedding provider not available");
        };
        let Some(generator) = generator.filter(|g| g.is_ready()) else {
            tracing::error!("text generator not available for query");
            return GenerationResult::error("Error: text generator not available");
        };

        let query_embedding = provider.embed(question);
        let results = if query_embedding.len() == config.embedding_dimension {
            self.store
                .search(&query_embedding, config.top_k, config.similarity_threshold)
                .unwrap_or_else(|e| {
                    tracing::error!("search failed during query: {e}");
                    Vec::new()
                })
        } else {
            tracing::error!(
                got = query_embedding.len(),
                expected = config.embedding_dimension,
                "query embedding dimension mismatch"
            );
            Vec::new()
        };

        if results.is_empty() {
            tracing::info!("no relevant chunks for query");
            return GenerationResult {
                text: INSUFFICIENT_INFORMATION.to_string(),
                tokens_generated: 0,
                prompt_tokens: 0,
                inference_time_ms: 0.0,
                finished: true,
                stop_reason: StopReason::Stop,
                metadata: json!({ "reason": "no_context" }),
                success: true,
            };
        }

        let (context, used) = self.build_context(&results, config.max_context_tokens);
        tracing::info!(
            chunks = used.len(),
            context_chars = context.len(),
            "built query context"
        );

        let prompt = config
            .prompt_template
            .replace("{context}", &context)
            .replace("{query}", question);

        let mut result = generator.generate(&prompt, options);

        if result.success {
            let sources: Vec<serde_json::Value> = used
                .iter()
                .map(|r| {
                    json!({
                        "id": r.chunk_id,
                        "score": r.similarity,
                        "text": r.text,
                        "metadata": r.metadata,
                    })
                })
                .collect();
            result.metadata = json!({
                "num_chunks": used.len(),
                "context_length": context.len(),
                "sources": sources,
            });
        }

        result
    }

    /// Concatenate ranked chunk texts, blank-line separated, admitting
    /// chunks while the token estimate fits the budget. The top chunk is
    /// always kept.
    fn build_context<'a>(
        &self,
        results: &'a [SearchResult],
        max_context_tokens: usize,
    ) -> (String, Vec<&'a SearchResult>) {
        let mut context = String::new();
        let mut used = Vec::new();
        let mut token_estimate = 0usize;

        for (i, result) in results.iter().enumerate() {
            let chunk_tokens = self.chunker.estimate_tokens(&result.text);
            if i > 0 && token_estimate + chunk_tokens > max_context_tokens {
                tracing::debug!(
                    dropped = results.len() - i,
                    "context budget reached, dropping lower-ranked chunks"
                );
                break;
            }

            if i > 0 {
                context.push_str("\n\n");
            }
            context.push_str(&result.text);
            token_estimate += chunk_tokens;
            used.push(result);
        }

        (context, used)
    }

    /// Drop all indexed chunks and restart chunk-id allocation
    pub fn clear(&self) {
        self.store.clear();
        self.next_chunk_id.store(0, Ordering::SeqCst);
    }

    pub fn document_count(&self) -> usize {
        self.store.size()
    }

    pub fn get_statistics(&self) -> serde_json::Value {
        let config = {
            let shared = self.shared.lock().unwrap();
            shared.config.clone()
        };

        let mut stats = self.store.get_statistics();
        stats["config"] = json!({
            "embedding_dimension": config.embedding_dimension,
            "top_k": config.top_k,
            "similarity_threshold": config.similarity_threshold,
            "max_context_tokens": config.max_context_tokens,
            "chunk_size": config.chunk_size,
            "chunk_overlap": config.chunk_overlap,
        });
        stats
    }

    /// Persist the vector store (index snapshot + metadata sidecar)
    pub fn save_index(&self, path: &std::path::Path) -> Result<()> {
        Ok(self.store.save(path)?)
    }

    /// Reload a previously saved vector store
    pub fn load_index(&self, path: &std::path::Path) -> Result<()> {
        Ok(self.store.load(path)?)
    }
}

fn enrich_metadata(metadata: serde_json::Value, preview: &str) -> serde_json::Value {
    match metadata {
        serde_json::Value::Object(mut map) => {
            map.insert("source_text".to_string(), json!(preview));
            serde_json::Value::Object(map)
        }
        serde_json::Value::Null => json!({ "source_text": preview }),
        other => json!({ "source_text": preview, "metadata": other }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic bag-of-words stub: each word lights up one dimension,
    /// so shared words produce cosine similarity.
    struct WordOverlapEmbedding {
        dimension: usize,
    }

    impl EmbeddingProvider for WordOverlapEmbedding {
        fn embed(&self, text: &str) -> Vec<f32> {
            let mut v = vec![0.0f32; self.dimension];
            for word in text.split_whitespace() {
                let word: String = word
                    .chars()
                    .filter(|c| c.is_alphanumeric())
                    .collect::<String>()
                    .to_lowercase();
                if word.is_empty() {
                    continue;
                }
                let hash: usize = word.bytes().fold(0usize, |acc, b| {
                    acc.wrapping_mul(31).wrapping_add(b as usize)
                });
                v[hash % self.dimension] += 1.0;
            }
            let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 1e-8 {
                for x in &mut v {
                    *x /= norm;
                }
            }
            v
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "word-overlap-stub"
        }
    }

    /// Echoes its prompt back and counts invocations
    struct EchoGenerator {
        calls: AtomicUsize,
    }

    impl EchoGenerator {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TextGenerator for EchoGenerator {
        fn generate(&self, prompt: &str, _options: &GenerationOptions) -> GenerationResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            GenerationResult {
                text: prompt.to_string(),
                tokens_generated: 1,
                prompt_tokens: 1,
                inference_time_ms: 0.1,
                finished: true,
                stop_reason: StopReason::Stop,
                metadata: serde_json::Value::Null,
                success: true,
            }
        }

        fn is_ready(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "echo-stub"
        }

        fn context_size(&self) -> usize {
            2048
        }
    }

    fn test_backend(dimension: usize) -> (RagBackend, Arc<EchoGenerator>) {
        let config = RagBackendConfig {
            embedding_dimension: dimension,
            similarity_threshold: 0.0,
            chunk_size: 64,
            chunk_overlap: 8,
            ..RagBackendConfig::default()
        };
        let generator = Arc::new(EchoGenerator::new());
        let backend = RagBackend::new(
            config,
            Some(Arc::new(WordOverlapEmbedding { dimension })),
            Some(generator.clone()),
        )
        .unwrap();
        (backend, generator)
    }

    #[test]
    fn add_document_indexes_chunks() {
        let (backend, _) = test_backend(32);
        let added = backend
            .add_document("The sky is blue. Water is wet.", serde_json::json!({}))
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(backend.document_count(), 1);
    }

    #[test]
    fn add_document_without_provider_errors() {
        let backend =
            RagBackend::new(RagBackendConfig::default(), None, None).unwrap();
        let err = backend.add_document("text", serde_json::Value::Null).unwrap_err();
        assert!(matches!(err, RagError::ProviderNotReady(_)));
    }

    #[test]
    fn empty_document_adds_nothing_without_error() {
        let (backend, _) = test_backend(32);
        let added = backend.add_document("", serde_json::Value::Null).unwrap();
        assert_eq!(added, 0);
        assert_eq!(backend.document_count(), 0);
    }

    #[test]
    fn query_without_generator_is_error_result() {
        let dimension = 16;
        let backend = RagBackend::new(
            RagBackendConfig {
                embedding_dimension: dimension,
                ..RagBackendConfig::default()
            },
            Some(Arc::new(WordOverlapEmbedding { dimension })),
            None,
        )
        .unwrap();

        let result = backend.query("anything", &GenerationOptions::default());
        assert!(!result.success);
        assert_eq!(result.stop_reason, StopReason::Error);
    }

    #[test]
    fn query_with_no_documents_returns_canned_answer() {
        let (backend, generator) = test_backend(32);
        let result = backend.query("what is this", &GenerationOptions::default());

        assert!(result.success);
        assert_eq!(result.text, INSUFFICIENT_INFORMATION);
        assert_eq!(result.metadata["reason"], "no_context");
        // The generator must never run on empty context
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn query_substitutes_context_and_question_into_prompt() {
        let (backend, generator) = test_backend(64);
        let document = "The sky is blue. Water is wet. Paris is the capital of France.";
        backend.add_document(document, serde_json::json!({})).unwrap();

        let result = backend.query(
            "What is the capital of France?",
            &GenerationOptions::default(),
        );

        assert!(result.success);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        // The echo stub returns the formatted prompt verbatim
        assert!(result.text.contains(document));
        assert!(result.text.contains("What is the capital of France?"));
        assert!(result.metadata["sources"].is_array());
        assert_eq!(result.metadata["num_chunks"], 1);
    }

    #[test]
    fn provider_swap_updates_dimension() {
        let (backend, _) = test_backend(32);
        backend.set_embedding_provider(Arc::new(WordOverlapEmbedding { dimension: 48 }));
        let stats = backend.get_statistics();
        assert_eq!(stats["config"]["embedding_dimension"], 48);
    }

    #[test]
    fn clear_resets_chunk_ids() {
        let (backend, _) = test_backend(32);
        backend
            .add_document("Some text to index. More text here.", serde_json::Value::Null)
            .unwrap();
        backend.clear();
        assert_eq!(backend.document_count(), 0);

        backend
            .add_document("Fresh start after clearing.", serde_json::Value::Null)
            .unwrap();
        let results = backend.search("fresh start clearing", 1).unwrap();
        assert_eq!(results[0].chunk_id, "chunk_0");
    }

    #[test]
    fn context_budget_bounds_chunk_count() {
        let dimension = 32;
        let config = RagBackendConfig {
            embedding_dimension: dimension,
            similarity_threshold: 0.0,
            top_k: 10,
            max_context_tokens: 10,
            chunk_size: 16,
            chunk_overlap: 0,
            ..RagBackendConfig::default()
        };
        let generator = Arc::new(EchoGenerator::new());
        let backend = RagBackend::new(
            config,
            Some(Arc::new(WordOverlapEmbedding { dimension })),
            Some(generator),
        )
        .unwrap();

        for i in 0..5 {
            backend
                .add_document(
                    &format!("shared words plus unique token number{i} appear here."),
                    serde_json::Value::Null,
                )
                .unwrap();
        }

        let result = backend.query("shared words appear", &GenerationOptions::default());
        assert!(result.success);
        // 10-token budget fits the top chunk and little else
        let num_chunks = result.metadata["num_chunks"].as_u64().unwrap();
        assert!(num_chunks < 5);
    }
}
