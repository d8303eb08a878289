//! ONNX text generator
//!
//! Manual autoregressive decoding against a causal ONNX model. The runtime
//! graph API has no KV-cache abstraction, so past key/value tensors are
//! carried explicitly: the first step feeds the whole prompt with
//! zero-length past tensors, every later step feeds one token plus the
//! previous step's `present.*` outputs as the new `past_key_values.*`
//! inputs. Input/output tensor order follows the layout of
//! optimum-exported decoders: `input_ids`, `attention_mask`,
//! `position_ids`, then `past_key_values.{layer}.{key,value}` pairs, with
//! `logits` followed by `present.{layer}.{key,value}` on the way out.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{Array, CowArray, IxDyn};
use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
use serde::{Deserialize, Serialize};

use super::sampling::sample_token;
use super::{GenerationError, GenerationOptions, GenerationResult, StopReason, TextGenerator};

const PAD_TOKEN: i64 = 0;
const BOS_TOKEN: i64 = 1;
const EOS_TOKEN: i64 = 2;
const UNK_TOKEN: i64 = 3;

/// ONNX generator configuration. Geometry defaults match TinyLlama.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnnxGeneratorConfig {
    pub max_context_length: usize,
    pub tokenizer_path: Option<PathBuf>,
    pub num_layers: usize,
    pub num_heads: usize,
    pub head_dim: usize,
    pub vocab_size: usize,
    pub intra_threads: i16,
}

impl Default for OnnxGeneratorConfig {
    fn default() -> Self {
        Self {
            max_context_length: 2048,
            tokenizer_path: None,
            num_layers: 22,
            num_heads: 4,
            head_dim: 64,
            vocab_size: 32_000,
            intra_threads: 4,
        }
    }
}

/// Word-level tokenizer with deterministic hash pseudo-ids for unknown
/// words. Deliberately simple; the embedding side carries the real
/// WordPiece implementation.
struct WordTokenizer {
    vocab: HashMap<String, i64>,
    reverse: HashMap<i64, String>,
    hasher: ahash::RandomState,
}

impl WordTokenizer {
    fn new() -> Self {
        let mut vocab = HashMap::new();
        vocab.insert("<pad>".to_string(), PAD_TOKEN);
        vocab.insert("<s>".to_string(), BOS_TOKEN);
        vocab.insert("</s>".to_string(), EOS_TOKEN);
        vocab.insert("<unk>".to_string(), UNK_TOKEN);

        let reverse = vocab.iter().map(|(t, &id)| (id, t.clone())).collect();

        Self {
            vocab,
            reverse,
            hasher: ahash::RandomState::with_seeds(3, 17, 257, 65537),
        }
    }

    /// Load a `tokenizer.json` vocabulary (`model.vocab` map)
    fn load_vocab(&mut self, path: &Path) -> Result<(), GenerationError> {
        let content = fs::read_to_string(path)?;
        let parsed: serde_json::Value = serde_json::from_str(&content)
            .map_err(|e| GenerationError::Tokenize(format!("invalid tokenizer JSON: {e}")))?;

        let Some(vocab_json) = parsed
            .get("model")
            .and_then(|m| m.get("vocab"))
            .and_then(|v| v.as_object())
        else {
            return Err(GenerationError::Tokenize(
                "tokenizer JSON has no model.vocab map".to_string(),
            ));
        };

        for (token, id) in vocab_json {
            if let Some(id) = id.as_i64() {
                self.vocab.insert(token.clone(), id);
                self.reverse.insert(id, token.clone());
            }
        }

        tracing::info!(tokens = self.vocab.len(), "loaded generator vocabulary");
        Ok(())
    }

    fn encode(&self, text: &str, add_bos: bool) -> Vec<i64> {
        let mut ids = Vec::new();
        if add_bos {
            ids.push(BOS_TOKEN);
        }

        for word in text.split_whitespace() {
            let lower = word.to_lowercase();
            match self.vocab.get(&lower) {
                Some(&id) => ids.push(id),
                None => {
                    let pseudo = 1000 + (self.hasher.hash_one(&lower) % 30_000) as i64;
                    ids.push(pseudo);
                }
            }
        }

        ids
    }

    fn decode(&self, ids: &[i64], skip_special: bool) -> String {
        let mut out = String::new();
        for (i, &id) in ids.iter().enumerate() {
            if skip_special && matches!(id, PAD_TOKEN | BOS_TOKEN | EOS_TOKEN) {
                continue;
            }
            match self.reverse.get(&id) {
                Some(token) => {
                    if i > 0 && !skip_special {
                        out.push(' ');
                    }
                    out.push_str(token);
                }
                None => {
                    if i > 0 {
                        out.push(' ');
                    }
                    out.push_str(&format!("[UNK_{id}]"));
                }
            }
        }
        out
    }
}

/// Per-layer past key/value buffers plus the explicit sequence-length
/// counter the decode loop threads through every step.
struct KvCache {
    layers: Vec<LayerKv>,
    seq_len: usize,
}

struct LayerKv {
    key: Vec<f32>,
    value: Vec<f32>,
}

impl KvCache {
    fn new(num_layers: usize) -> Self {
        let layers = (0..num_layers)
            .map(|_| LayerKv {
                key: Vec::new(),
                value: Vec::new(),
            })
            .collect();
        Self { layers, seq_len: 0 }
    }
}

/// Text generator over a causal ONNX model.
///
/// Stateless between calls: every `generate` owns its KV cache, token
/// buffer, and RNG, so concurrent calls on one instance do not share
/// mutable state.
pub struct OnnxTextGenerator {
    session: Session,
    // Environment must outlive the session
    _environment: std::sync::Arc<Environment>,
    tokenizer: WordTokenizer,
    config: OnnxGeneratorConfig,
}

impl OnnxTextGenerator {
    pub fn new(
        model_path: impl AsRef<Path>,
        config: OnnxGeneratorConfig,
    ) -> Result<Self, GenerationError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(GenerationError::ModelNotFound(model_path.to_path_buf()));
        }

        let mut tokenizer = WordTokenizer::new();
        if let Some(tokenizer_path) = &config.tokenizer_path {
            if let Err(e) = tokenizer.load_vocab(tokenizer_path) {
                tracing::warn!(
                    path = %tokenizer_path.display(),
                    "failed to load generator vocabulary, using word-level fallback: {e}"
                );
            }
        }

        let environment = Environment::builder()
            .with_name("ragmill-generator")
            .build()
            .map_err(|e| GenerationError::InitializationError(e.to_string()))?
            .into_arc();

        let session = SessionBuilder::new(&environment)
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(config.intra_threads))
            .and_then(|b| b.with_model_from_file(model_path))
            .map_err(|e| GenerationError::InitializationError(e.to_string()))?;

        tracing::info!(
            model = %model_path.display(),
            max_context = config.max_context_length,
            layers = config.num_layers,
            "ONNX generator initialized"
        );

        Ok(Self {
            session,
            _environment: environment,
            tokenizer,
            config,
        })
    }

    /// One forward pass: feed `step_tokens` plus the cache, return the
    /// logits of the last position and fold the `present.*` outputs back
    /// into the cache.
    fn decode_step(
        &self,
        step_tokens: &[i64],
        cache: &mut KvCache,
    ) -> Result<Vec<f32>, GenerationError> {
        let cur_len = step_tokens.len();
        let total_len = cache.seq_len + cur_len;
        let heads = self.config.num_heads;
        let head_dim = self.config.head_dim;

        let shape_err = |e: ndarray::ShapeError| GenerationError::Decode(e.to_string());

        // input_ids: [1, cur_len]
        let input_ids = Array::from_shape_vec(IxDyn(&[1, cur_len]), step_tokens.to_vec())
            .map_err(shape_err)?;
        // attention_mask covers past + current positions: [1, total_len]
        let attention_mask =
            Array::from_shape_vec(IxDyn(&[1, total_len]), vec![1i64; total_len])
                .map_err(shape_err)?;
        // position_ids continue from the cached sequence: [1, cur_len]
        let position_ids = Array::from_shape_vec(
            IxDyn(&[1, cur_len]),
            (cache.seq_len..total_len).map(|p| p as i64).collect(),
        )
        .map_err(shape_err)?;

        let int_arrays: Vec<CowArray<i64, IxDyn>> = vec![
            CowArray::from(input_ids),
            CowArray::from(attention_mask),
            CowArray::from(position_ids),
        ];

        // past_key_values.{layer}.{key,value}: [1, heads, past_len, head_dim]
        let kv_shape = IxDyn(&[1, heads, cache.seq_len, head_dim]);
        let mut kv_arrays: Vec<CowArray<f32, IxDyn>> =
            Vec::with_capacity(self.config.num_layers * 2);
        for layer in &cache.layers {
            kv_arrays.push(CowArray::from(
                Array::from_shape_vec(kv_shape.clone(), layer.key.clone()).map_err(shape_err)?,
            ));
            kv_arrays.push(CowArray::from(
                Array::from_shape_vec(kv_shape.clone(), layer.value.clone()).map_err(shape_err)?,
            ));
        }

        let run_err = |e: ort::OrtError| GenerationError::Decode(e.to_string());

        let allocator = self.session.allocator();
        let mut inputs: Vec<Value> = Vec::with_capacity(int_arrays.len() + kv_arrays.len());
        for array in &int_arrays {
            inputs.push(Value::from_array(allocator, array).map_err(run_err)?);
        }
        for array in &kv_arrays {
            inputs.push(Value::from_array(allocator, array).map_err(run_err)?);
        }

        let outputs = self.session.run(inputs).map_err(run_err)?;

        let expected_outputs = 1 + self.config.num_layers * 2;
        if outputs.len() < expected_outputs {
            return Err(GenerationError::Decode(format!(
                "model returned {} outputs, expected {}",
                outputs.len(),
                expected_outputs
            )));
        }

        // logits: [1, cur_len, vocab]; keep only the last position
        let logits = outputs[0].try_extract::<f32>().map_err(run_err)?;
        let logits_view = logits.view();
        let flat = logits_view
            .as_slice()
            .ok_or_else(|| GenerationError::Decode("non-contiguous logits tensor".to_string()))?;

        let vocab = self.config.vocab_size;
        let offset = (cur_len - 1) * vocab;
        if flat.len() < offset + vocab {
            return Err(GenerationError::Decode(format!(
                "logits tensor of {} elements too small for vocab {}",
                flat.len(),
                vocab
            )));
        }
        let last_logits = flat[offset..offset + vocab].to_vec();

        // Carry present.* outputs over as next step's past.*
        for (layer_idx, layer) in cache.layers.iter_mut().enumerate() {
            let key = outputs[1 + 2 * layer_idx]
                .try_extract::<f32>()
                .map_err(run_err)?;
            layer.key = key.view().iter().copied().collect();

            let value = outputs[2 + 2 * layer_idx]
                .try_extract::<f32>()
                .map_err(run_err)?;
            layer.value = value.view().iter().copied().collect();
        }
        cache.seq_len = total_len;

        Ok(last_logits)
    }
}

impl TextGenerator for OnnxTextGenerator {
    fn generate(&self, prompt: &str, options: &GenerationOptions) -> GenerationResult {
        let start = Instant::now();

        let mut input_ids = self.tokenizer.encode(prompt, true);
        if input_ids.is_empty() {
            input_ids.push(BOS_TOKEN);
        }
        let prompt_tokens = input_ids.len();

        tracing::debug!(
            prompt_tokens,
            max_tokens = options.max_tokens,
            temperature = options.temperature,
            top_p = options.top_p,
            "starting ONNX generation"
        );

        let mut cache = KvCache::new(self.config.num_layers);
        let mut rng = rand::thread_rng();

        let mut tokens_generated = 0usize;
        let mut finished = false;
        let mut stop_reason = StopReason::Length;

        for step in 0..options.max_tokens {
            let step_tokens: Vec<i64> = if step == 0 {
                input_ids.clone()
            } else {
                input_ids.last().copied().into_iter().collect()
            };

            let logits = match self.decode_step(&step_tokens, &mut cache) {
                Ok(logits) => logits,
                Err(e) => {
                    tracing::error!("decode step {step} failed: {e}");
                    if tokens_generated == 0 {
                        let mut result = GenerationResult::error(String::new());
                        result.prompt_tokens = prompt_tokens;
                        result.inference_time_ms = start.elapsed().as_secs_f64() * 1000.0;
                        return result;
                    }
                    stop_reason = StopReason::Error;
                    break;
                }
            };

            let next_token = match sample_token(&logits, options.temperature, options.top_p, &mut rng)
            {
                Some(idx) => idx as i64,
                None => EOS_TOKEN,
            };
            input_ids.push(next_token);
            tokens_generated += 1;

            if next_token == EOS_TOKEN || next_token == PAD_TOKEN {
                finished = true;
                stop_reason = StopReason::Stop;
                break;
            }

            if !options.stop_sequences.is_empty() {
                let tail = self
                    .tokenizer
                    .decode(&input_ids[prompt_tokens..], false);
                if options
                    .stop_sequences
                    .iter()
                    .any(|stop| tail.contains(stop.as_str()))
                {
                    finished = true;
                    stop_reason = StopReason::StopSequence;
                    break;
                }
            }
        }

        let text = self.tokenizer.decode(&input_ids[prompt_tokens..], true);
        let inference_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        if inference_time_ms > 0.0 {
            tracing::debug!(
                tokens_generated,
                tokens_per_sec = tokens_generated as f64 / (inference_time_ms / 1000.0),
                "ONNX generation complete"
            );
        }

        GenerationResult {
            text,
            tokens_generated,
            prompt_tokens,
            inference_time_ms,
            finished,
            stop_reason,
            metadata: serde_json::Value::Null,
            success: true,
        }
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "onnx-generator"
    }

    fn context_size(&self) -> usize {
        self.config.max_context_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_tokenizer_is_deterministic_and_case_insensitive() {
        let tokenizer = WordTokenizer::new();
        let a = tokenizer.encode("Hello World", true);
        let b = tokenizer.encode("hello world", true);
        assert_eq!(a, b);
        assert_eq!(a[0], BOS_TOKEN);
        assert_eq!(a.len(), 3);
        assert!(a[1] >= 1000);
    }

    #[test]
    fn word_tokenizer_round_trips_special_tokens() {
        let tokenizer = WordTokenizer::new();
        let ids = tokenizer.encode("<s> </s>", false);
        assert_eq!(ids, vec![BOS_TOKEN, EOS_TOKEN]);
        assert_eq!(tokenizer.decode(&ids, true), "");
    }

    #[test]
    fn unknown_ids_render_as_placeholders() {
        let tokenizer = WordTokenizer::new();
        let text = tokenizer.decode(&[BOS_TOKEN, 4242], true);
        assert!(text.contains("[UNK_4242]"));
    }

    #[test]
    fn kv_cache_starts_empty_per_layer() {
        let cache = KvCache::new(3);
        assert_eq!(cache.layers.len(), 3);
        assert_eq!(cache.seq_len, 0);
        assert!(cache.layers.iter().all(|l| l.key.is_empty() && l.value.is_empty()));
    }

    #[test]
    fn config_defaults_parse_from_empty_json() {
        let config: OnnxGeneratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.num_layers, 22);
        assert_eq!(config.max_context_length, 2048);
        assert_eq!(config.vocab_size, 32_000);
    }
}
