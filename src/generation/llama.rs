//! GGUF text generator
//!
//! Drives a quantized model through the llama.cpp runtime. The runtime
//! context borrows its model, so both live on a dedicated worker thread and
//! `generate` is a channel round-trip; the channel doubles as the lock that
//! single-threads decoding for one context instance. The context is reused
//! across calls, but its KV cache is cleared before each generation so
//! every query starts from a clean position-0 state.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Instant;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use serde::{Deserialize, Serialize};

use super::{GenerationError, GenerationOptions, GenerationResult, StopReason, TextGenerator};

/// Tokens held back from the context budget for the answer framing
const CONTEXT_HEADROOM: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlamaGeneratorConfig {
    /// Requested context size; capped at the model's trained context
    pub context_size: usize,
    /// Prompt decode batch size (the runtime rejects over-large batches)
    pub batch_size: usize,
    /// Seed for the final categorical sampler
    pub seed: u32,
}

impl Default for LlamaGeneratorConfig {
    fn default() -> Self {
        Self {
            context_size: 2048,
            batch_size: 64,
            seed: 1234,
        }
    }
}

enum WorkerRequest {
    Generate {
        prompt: String,
        options: GenerationOptions,
        reply: mpsc::Sender<GenerationResult>,
    },
}

/// Text generator over a GGUF model.
///
/// Construction fails when the model cannot be loaded or the context
/// cannot be created; the worker drops any partially-created runtime
/// objects before the error is returned. Generation is cooperatively
/// cancellable between tokens via [`LlamaTextGenerator::cancel`].
pub struct LlamaTextGenerator {
    sender: Mutex<mpsc::Sender<WorkerRequest>>,
    cancel: Arc<AtomicBool>,
    context_size: usize,
}

impl LlamaTextGenerator {
    pub fn new(
        model_path: impl AsRef<Path>,
        config: LlamaGeneratorConfig,
    ) -> Result<Self, GenerationError> {
        let model_path = model_path.as_ref().to_path_buf();
        if !model_path.exists() {
            return Err(GenerationError::ModelNotFound(model_path));
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let (request_tx, request_rx) = mpsc::channel();
        let (init_tx, init_rx) = mpsc::channel();

        let worker_cancel = Arc::clone(&cancel);
        thread::Builder::new()
            .name("ragmill-llama".to_string())
            .spawn(move || worker_main(model_path, config, worker_cancel, request_rx, init_tx))
            .map_err(|e| GenerationError::InitializationError(e.to_string()))?;

        let context_size = init_rx
            .recv()
            .map_err(|_| GenerationError::WorkerGone)??;

        Ok(Self {
            sender: Mutex::new(request_tx),
            cancel,
            context_size,
        })
    }

    /// Request cooperative cancellation of the in-flight generation. The
    /// flag is checked once per generated token; the context stays valid
    /// for subsequent calls.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }
}

impl TextGenerator for LlamaTextGenerator {
    fn generate(&self, prompt: &str, options: &GenerationOptions) -> GenerationResult {
        let (reply_tx, reply_rx) = mpsc::channel();

        let request = WorkerRequest::Generate {
            prompt: prompt.to_string(),
            options: options.clone(),
            reply: reply_tx,
        };

        let sent = self.sender.lock().unwrap().send(request);
        if sent.is_err() {
            return GenerationResult::error("Error: GGUF generator worker is gone");
        }

        reply_rx
            .recv()
            .unwrap_or_else(|_| GenerationResult::error("Error: GGUF generator worker is gone"))
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "llamacpp"
    }

    fn context_size(&self) -> usize {
        self.context_size
    }
}

/// The llama backend may only be initialized once per process
fn shared_backend() -> Result<&'static LlamaBackend, GenerationError> {
    static BACKEND: OnceLock<LlamaBackend> = OnceLock::new();

    if let Some(backend) = BACKEND.get() {
        return Ok(backend);
    }

    match LlamaBackend::init() {
        Ok(backend) => Ok(BACKEND.get_or_init(|| backend)),
        // Lost a race with another thread's init
        Err(e) => BACKEND
            .get()
            .ok_or_else(|| GenerationError::InitializationError(e.to_string())),
    }
}

fn worker_main(
    model_path: PathBuf,
    config: LlamaGeneratorConfig,
    cancel: Arc<AtomicBool>,
    requests: mpsc::Receiver<WorkerRequest>,
    init_tx: mpsc::Sender<Result<usize, GenerationError>>,
) {
    let backend = match shared_backend() {
        Ok(backend) => backend,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    let model_params = LlamaModelParams::default();
    let model = match LlamaModel::load_from_file(backend, &model_path, &model_params) {
        Ok(model) => model,
        Err(e) => {
            let _ = init_tx.send(Err(GenerationError::InitializationError(format!(
                "failed to load GGUF model {}: {e}",
                model_path.display()
            ))));
            return;
        }
    };

    // Never exceed the model's trained context
    let n_ctx_train = model.n_ctx_train() as usize;
    let context_size = config.context_size.min(n_ctx_train).max(1);

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(context_size as u32))
        .with_n_batch(config.batch_size as u32);

    let mut ctx = match model.new_context(backend, ctx_params) {
        Ok(ctx) => ctx,
        Err(e) => {
            // Model is dropped here before the error is surfaced
            let _ = init_tx.send(Err(GenerationError::InitializationError(format!(
                "failed to create llama context: {e}"
            ))));
            return;
        }
    };

    tracing::info!(
        model = %model_path.display(),
        context_size,
        n_ctx_train,
        batch_size = config.batch_size,
        "GGUF generator initialized"
    );

    if init_tx.send(Ok(context_size)).is_err() {
        return;
    }

    while let Ok(request) = requests.recv() {
        match request {
            WorkerRequest::Generate {
                prompt,
                options,
                reply,
            } => {
                let result = run_generation(&mut ctx, &model, &config, &cancel, &prompt, &options);
                let _ = reply.send(result);
            }
        }
    }
}

fn run_generation(
    ctx: &mut LlamaContext,
    model: &LlamaModel,
    config: &LlamaGeneratorConfig,
    cancel: &AtomicBool,
    prompt: &str,
    options: &GenerationOptions,
) -> GenerationResult {
    let start = Instant::now();
    let finalize = |mut result: GenerationResult| -> GenerationResult {
        result.inference_time_ms = start.elapsed().as_secs_f64() * 1000.0;
        result
    };

    cancel.store(false, Ordering::SeqCst);

    // Every query starts from a clean position-0 state even though the
    // context object is reused across calls
    ctx.clear_kv_cache();

    let prompt_tokens = match model.str_to_token(prompt, AddBos::Always) {
        Ok(tokens) if !tokens.is_empty() => tokens,
        Ok(_) => return finalize(GenerationResult::error("Error: failed to tokenize prompt")),
        Err(e) => {
            tracing::error!("prompt tokenization failed: {e}");
            return finalize(GenerationResult::error("Error: failed to tokenize prompt"));
        }
    };

    let n_ctx = ctx.n_ctx() as usize;
    let n_prompt = prompt_tokens.len();
    let available = n_ctx.saturating_sub(n_prompt + CONTEXT_HEADROOM);
    if available == 0 {
        tracing::error!(n_prompt, n_ctx, "prompt exceeds context");
        return finalize(GenerationResult::error(
            "Error: prompt exceeds maximum context length",
        ));
    }

    let max_tokens = if options.max_tokens > 0 {
        options.max_tokens
    } else {
        512
    };
    let n_max_tokens = max_tokens.min(available);

    tracing::debug!(n_prompt, n_max_tokens, n_ctx, "starting GGUF generation");

    let mut batch = LlamaBatch::new(n_ctx, 1);

    // Decode the prompt in n_batch-sized slices; logits only for the final
    // prompt token
    let mut offset = 0;
    while offset < n_prompt {
        let slice_end = (offset + config.batch_size).min(n_prompt);
        batch.clear();

        for (i, token) in prompt_tokens[offset..slice_end].iter().enumerate() {
            let pos = (offset + i) as i32;
            let wants_logits = offset + i + 1 == n_prompt;
            if let Err(e) = batch.add(*token, pos, &[0], wants_logits) {
                tracing::error!("batch add failed at prompt position {pos}: {e}");
                return finalize(GenerationResult::error("Error: failed to decode prompt"));
            }
        }

        if let Err(e) = ctx.decode(&mut batch) {
            tracing::error!("prompt decode failed at offset {offset}: {e}");
            return finalize(GenerationResult::error("Error: failed to decode prompt"));
        }

        offset = slice_end;
    }

    // Fresh sampler chain per call, starting clean after the prompt phase
    let mut chain = Vec::new();
    if options.temperature > 0.0 {
        chain.push(LlamaSampler::temp(options.temperature));
    }
    chain.push(LlamaSampler::top_k(options.top_k as i32));
    chain.push(LlamaSampler::top_p(options.top_p, 1));
    chain.push(LlamaSampler::dist(config.seed));
    let mut sampler = LlamaSampler::chain_simple(chain);

    let mut text = String::with_capacity(n_max_tokens * 4);
    let mut n_generated = 0usize;
    let mut n_cur = n_prompt as i32;
    let mut stop_reason = StopReason::Length;
    let mut finished = false;

    while n_generated < n_max_tokens {
        if cancel.load(Ordering::SeqCst) {
            stop_reason = StopReason::Cancelled;
            break;
        }

        let token = sampler.sample(ctx, -1);
        sampler.accept(token);

        if model.is_eog_token(token) {
            stop_reason = StopReason::Stop;
            finished = true;
            break;
        }

        match model.token_to_str(token, Special::Tokenize) {
            Ok(piece) => text.push_str(&piece),
            Err(e) => tracing::debug!("skipping unrepresentable token: {e}"),
        }

        batch.clear();
        if let Err(e) = batch.add(token, n_cur, &[0], true) {
            tracing::error!("batch add failed during generation: {e}");
            stop_reason = StopReason::Error;
            break;
        }
        n_cur += 1;

        if let Err(e) = ctx.decode(&mut batch) {
            tracing::error!("decode failed at generated token {n_generated}: {e}");
            stop_reason = StopReason::Error;
            break;
        }

        n_generated += 1;
    }

    if n_generated >= n_max_tokens {
        finished = true;
    }

    tracing::debug!(
        n_generated,
        n_max_tokens,
        %stop_reason,
        "GGUF generation complete"
    );

    finalize(GenerationResult {
        text,
        tokens_generated: n_generated,
        prompt_tokens: n_prompt,
        inference_time_ms: 0.0,
        finished: finished && stop_reason != StopReason::Cancelled,
        stop_reason,
        metadata: serde_json::Value::Null,
        success: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_model_fails_construction() {
        let err = LlamaTextGenerator::new(
            "/nonexistent/model.gguf",
            LlamaGeneratorConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GenerationError::ModelNotFound(_)));
    }

    #[test]
    fn config_defaults_parse_from_empty_json() {
        let config: LlamaGeneratorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.context_size, 2048);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.seed, 1234);
    }
}
