//! Generation parameters and per-slot sampler chains.
//!
//! Each slot gets its own sampler so repetition penalties track that slot's
//! history alone and cross-slot interleaving cannot perturb the draw order.

use std::time::{SystemTime, UNIX_EPOCH};

use gg::sampling::LlamaSampler;
use gg::token::LlamaToken;
use serde::{Deserialize, Serialize};

use crate::engine::ControlStops;

/// Everything one `generate_parallel` call needs besides the prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateParams {
    /// Generation budget per prompt; zero means "admit, decode nothing".
    pub max_tokens: usize,
    /// Concurrent streams. The context must have been built with
    /// `n_seq_max >= n_parallel + 1` (one extra for the shared prefix).
    pub n_parallel: usize,
    pub top_k: i32,
    pub top_p: f32,
    /// Non-positive temperature switches the chain to greedy decoding.
    pub temperature: f32,
    pub repeat_last_n: i32,
    pub penalty_repeat: f32,
    /// Negative means "derive from wall clock", resolved once per call.
    pub seed: i64,
    /// Draw a progress bar on stderr after each finalised prompt.
    pub show_progress: bool,
    /// Multi-token end-of-turn spellings, registered per model.
    #[serde(default)]
    pub control_stops: ControlStops,
}

impl Default for GenerateParams {
    fn default() -> Self {
        GenerateParams {
            max_tokens: 256,
            n_parallel: 4,
            top_k: 40,
            top_p: 0.9,
            temperature: 0.8,
            repeat_last_n: 64,
            penalty_repeat: 1.1,
            seed: -1,
            show_progress: false,
            control_stops: ControlStops::default(),
        }
    }
}

/// Resolve the effective seed once per call so every slot in the call shares
/// it and identical prompts decode identically.
pub(crate) fn resolve_seed(seed: i64) -> u32 {
    if seed >= 0 {
        return seed as u32;
    }
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(31337)
}

/// Build a fresh sampler chain for one slot, primed with its prompt tokens so
/// repetition penalties see the full history.
pub(crate) fn slot_sampler(
    params: &GenerateParams,
    seed: u32,
    prompt: &[LlamaToken],
) -> LlamaSampler {
    let chain = if params.temperature <= 0.0 {
        LlamaSampler::chain_simple([
            LlamaSampler::penalties(params.repeat_last_n, params.penalty_repeat, 0.0, 0.0),
            LlamaSampler::greedy(),
        ])
    } else {
        LlamaSampler::chain_simple([
            LlamaSampler::penalties(params.repeat_last_n, params.penalty_repeat, 0.0, 0.0),
            LlamaSampler::top_k(params.top_k),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed),
        ])
    };
    chain.with_tokens(prompt.iter().copied())
}
