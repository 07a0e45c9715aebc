//! Runtime bootstrap: backend, model, and context construction.
//!
//! The engine itself only ever sees a `LlamaContext`; everything here runs
//! once per process (backend) or once per model/context.

use std::num::NonZeroU32;

use eyre::Result;
use gg::context::LlamaContext;
use gg::context::params::LlamaContextParams;
use gg::llama_backend::LlamaBackend;
use gg::model::LlamaModel;
use gg::model::params::LlamaModelParams;
use serde::{Deserialize, Serialize};

/// How the decode context is sized. `n_parallel` is the slot count the
/// engine may multiplex; one extra sequence is reserved for the shared
/// prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Context window in tokens; `None` picks the model's native size,
    /// capped at 8192.
    pub n_ctx: Option<u32>,
    /// Decode batch capacity, also used as the micro-batch size.
    pub n_batch: u32,
    /// Concurrent sequence slots.
    pub n_parallel: u32,
    /// Worker threads; `None` uses every available core.
    pub n_threads: Option<i32>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            n_ctx: None,
            n_batch: 512,
            n_parallel: 4,
            n_threads: None,
        }
    }
}

/// Load the model into memory (GPU layers enabled by default) and return
/// backend+model.
pub fn load_model(model_path: &str) -> Result<(LlamaBackend, LlamaModel)> {
    let backend = LlamaBackend::init()?;
    let model_params = LlamaModelParams::default().with_n_gpu_layers(u32::MAX);
    let model = LlamaModel::load_from_file(&backend, model_path, &model_params)?;
    tracing::debug!(model_path, "model loaded");
    Ok((backend, model))
}

/// Build a decode context sized for `config.n_parallel` concurrent streams.
pub fn new_context<'m>(
    backend: &LlamaBackend,
    model: &'m LlamaModel,
    config: &ContextConfig,
) -> Result<LlamaContext<'m>> {
    let num_threads = config.n_threads.unwrap_or_else(|| {
        std::thread::available_parallelism()
            .ok()
            .map(|n| n.get())
            .unwrap_or(1) as i32
    });
    let n_ctx = config.n_ctx.unwrap_or_else(|| 8_192.min(model.n_ctx_train()));

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_threads(num_threads)
        .with_n_threads_batch(num_threads)
        .with_n_batch(config.n_batch)
        .with_n_ubatch(config.n_batch)
        .with_n_seq_max(config.n_parallel + 1);

    let ctx = model.new_context(backend, ctx_params)?;
    Ok(ctx)
}
