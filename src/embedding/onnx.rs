//! ONNX embedding provider
//!
//! Runs a bidirectional transformer over tokenized text and pools the
//! hidden states into a fixed-dimension unit vector: tokenize, infer,
//! mean-pool over non-padding positions, L2-normalize.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ndarray::{Array, CowArray, IxDyn};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use serde::{Deserialize, Serialize};

use super::tokenizer::WordPieceTokenizer;
use super::{EmbeddingError, EmbeddingProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxEmbeddingConfig {
    /// Vocabulary file; defaults to `vocab.txt` beside the model
    pub vocab_path: Option<PathBuf>,
    pub max_seq_length: usize,
    /// Expected embedding dimension. A hint only: the model's own output
    /// shape is ground truth and overrides this when they disagree.
    pub dimension: usize,
    pub intra_threads: i16,
}

impl Default for OnnxEmbeddingConfig {
    fn default() -> Self {
        Self {
            vocab_path: None,
            max_seq_length: 512,
            dimension: 384,
            intra_threads: 4,
        }
    }
}

/// Embedding provider over an ONNX sentence-transformer.
///
/// Construction fails hard when the runtime, vocabulary, or model cannot be
/// initialized; a constructed provider is always ready. `embed` is safe to
/// call from multiple threads: every call allocates its own tensors.
pub struct OnnxEmbeddingProvider {
    session: Session,
    // Environment must outlive the session
    _environment: Arc<Environment>,
    tokenizer: WordPieceTokenizer,
    dimension: AtomicUsize,
    max_seq_length: usize,
}

impl OnnxEmbeddingProvider {
    pub fn new(
        model_path: impl AsRef<Path>,
        config: OnnxEmbeddingConfig,
    ) -> Result<Self, EmbeddingError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(EmbeddingError::InitializationError(format!(
                "model file not found: {}",
                model_path.display()
            )));
        }

        let vocab_path = config.vocab_path.clone().unwrap_or_else(|| {
            model_path
                .parent()
                .unwrap_or(Path::new(""))
                .join("vocab.txt")
        });
        if !vocab_path.exists() {
            return Err(EmbeddingError::Vocabulary(format!(
                "tokenizer vocabulary not found: {}",
                vocab_path.display()
            )));
        }

        let mut tokenizer = WordPieceTokenizer::new();
        tokenizer.load_vocab(&vocab_path)?;

        let environment = Environment::builder()
            .with_name("ragmill-embedding")
            .build()
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?
            .into_arc();

        let session = SessionBuilder::new(&environment)
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(config.intra_threads))
            .and_then(|b| b.with_model_from_file(model_path))
            .map_err(|e| EmbeddingError::InitializationError(e.to_string()))?;

        tracing::info!(
            model = %model_path.display(),
            vocab = %vocab_path.display(),
            dimension = config.dimension,
            "ONNX embedding provider initialized"
        );

        Ok(Self {
            session,
            _environment: environment,
            tokenizer,
            dimension: AtomicUsize::new(config.dimension),
            max_seq_length: config.max_seq_length,
        })
    }

    fn try_embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let token_ids = self.tokenizer.encode(text, self.max_seq_length);
        let attention_mask = self.tokenizer.create_attention_mask(&token_ids);
        let token_type_ids = self.tokenizer.create_token_type_ids(self.max_seq_length);

        let seq_len = self.max_seq_length;
        let shape = IxDyn(&[1, seq_len]);
        let shape_err =
            |e: ndarray::ShapeError| EmbeddingError::GenerationError(e.to_string());
        let run_err = |e: ort::OrtError| EmbeddingError::GenerationError(e.to_string());

        let arrays: Vec<CowArray<i64, IxDyn>> = vec![
            CowArray::from(
                Array::from_shape_vec(shape.clone(), token_ids).map_err(shape_err)?,
            ),
            CowArray::from(
                Array::from_shape_vec(shape.clone(), attention_mask.clone())
                    .map_err(shape_err)?,
            ),
            CowArray::from(Array::from_shape_vec(shape, token_type_ids).map_err(shape_err)?),
        ];

        let allocator = self.session.allocator();
        let mut inputs: Vec<Value> = Vec::with_capacity(arrays.len());
        for array in &arrays {
            inputs.push(Value::from_array(allocator, array).map_err(run_err)?);
        }

        let outputs = self.session.run(inputs).map_err(run_err)?;
        let hidden = outputs
            .first()
            .ok_or_else(|| EmbeddingError::GenerationError("model produced no output".into()))?
            .try_extract::<f32>()
            .map_err(run_err)?;
        let view = hidden.view();

        // The model's own hidden dimension wins over the configured hint
        let shape = view.shape();
        let hidden_dim = if shape.len() >= 3 {
            shape[2]
        } else {
            self.dimension.load(Ordering::Relaxed)
        };
        if hidden_dim != self.dimension.load(Ordering::Relaxed) {
            tracing::info!(
                configured = self.dimension.load(Ordering::Relaxed),
                actual = hidden_dim,
                "model hidden dimension differs from configuration, using actual"
            );
            self.dimension.store(hidden_dim, Ordering::Relaxed);
        }

        let flat = view.as_slice().ok_or_else(|| {
            EmbeddingError::GenerationError("non-contiguous hidden-state tensor".into())
        })?;
        if flat.len() < seq_len * hidden_dim {
            return Err(EmbeddingError::GenerationError(format!(
                "hidden-state tensor of {} elements too small for [{seq_len}, {hidden_dim}]",
                flat.len()
            )));
        }

        let mut pooled = mean_pool(flat, &attention_mask, seq_len, hidden_dim);
        normalize(&mut pooled);
        Ok(pooled)
    }
}

impl EmbeddingProvider for OnnxEmbeddingProvider {
    fn embed(&self, text: &str) -> Vec<f32> {
        match self.try_embed(text) {
            Ok(embedding) => embedding,
            Err(e) => {
                tracing::error!("embedding generation failed: {e}");
                vec![0.0; self.dimension.load(Ordering::Relaxed)]
            }
        }
    }

    fn dimension(&self) -> usize {
        self.dimension.load(Ordering::Relaxed)
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "onnx-embedding"
    }
}

/// Average token embeddings over attended positions only; padding
/// contributes to neither sum nor count.
fn mean_pool(
    hidden: &[f32],
    attention_mask: &[i64],
    seq_len: usize,
    hidden_dim: usize,
) -> Vec<f32> {
    let mut pooled = vec![0.0f32; hidden_dim];
    let mut valid_tokens = 0usize;

    for (i, &mask) in attention_mask.iter().enumerate().take(seq_len) {
        if mask != 1 {
            continue;
        }
        let row = &hidden[i * hidden_dim..(i + 1) * hidden_dim];
        for (acc, &v) in pooled.iter_mut().zip(row) {
            *acc += v;
        }
        valid_tokens += 1;
    }

    if valid_tokens > 0 {
        let inv = 1.0 / valid_tokens as f32;
        for v in &mut pooled {
            *v *= inv;
        }
    }

    pooled
}

/// L2-normalize in place; a no-op below epsilon to avoid blowing up on
/// degenerate inputs.
fn normalize(vec: &mut [f32]) {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 1e-8 {
        for v in vec.iter_mut() {
            *v /= norm;
        }
    }
}
