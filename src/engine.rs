//! Parallel generation: prompt admission, shared-prefix KV reuse, and
//! cooperative decode scheduling across a fixed table of sequence slots.
//! Terminology:
//! - "shared prefix" = longest token prefix common to every prompt, decoded
//!   once under seq-id 0 and cloned into each slot.
//! - "slot" = one concurrent stream; slot `k` owns seq-id `k + 1`.
//! - "chunk cap" = max tokens per decode call; halved on KV pressure.

use std::collections::VecDeque;

use eyre::eyre;
use gg::context::LlamaContext;
use gg::llama_backend::LlamaBackend;
use gg::model::{AddBos, LlamaModel, Special};
use gg::token::LlamaToken;

use crate::progress::Progress;
use crate::runtime::{self, ContextConfig};
use crate::sampling::{self, GenerateParams};

mod driver;
mod kv;
mod prefix;
mod scrub;
mod slot;
mod stop;

use driver::{BatchDriver, BatchRow, SubmitOutcome};
use slot::Slot;

pub use stop::ControlStops;

/// Positions kept free above the prompt so generation has room to grow.
const CONTEXT_HEADROOM: usize = 64;

/// Generated tokens required before the conversation-marker stop applies.
const TURN_MARKER_WARMUP: usize = 6;

/// Failures that abort a whole call. Per-prompt failures never surface here;
/// they become `"[ERROR] …"` strings at the prompt's result index instead.
#[derive(Debug)]
pub enum EngineError {
    /// The call was malformed; nothing was mutated.
    InvalidArguments(&'static str),
    /// The runtime refused to tokenise a prompt during the pre-pass.
    Tokenization(String),
    /// Unrecoverable failure inside the generation loop. The KV memory has
    /// been cleared; the context remains usable.
    Generation(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidArguments(msg) => write!(f, "invalid arguments: {msg}"),
            EngineError::Tokenization(msg) => write!(f, "tokenisation failed: {msg}"),
            EngineError::Generation(msg) => write!(f, "parallel generation failed: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Generate a completion for every prompt, multiplexing up to
/// `params.n_parallel` streams over one context. Results come back in prompt
/// order and always match the input length on success; prompts that fail
/// individually yield `"[ERROR] …"` strings instead of unwinding the call.
/// The context's KV memory is cleared on entry and again before returning.
pub fn generate_parallel(
    ctx: &mut LlamaContext,
    prompts: &[String],
    params: &GenerateParams,
) -> Result<Vec<String>, EngineError> {
    if prompts.is_empty() {
        return Err(EngineError::InvalidArguments(
            "at least one prompt is required",
        ));
    }
    let token_lists = prompts
        .iter()
        .map(|p| {
            ctx.model
                .str_to_token(p, AddBos::Always)
                .map_err(|e| EngineError::Tokenization(e.to_string()))
        })
        .collect::<Result<Vec<_>, EngineError>>()?;

    Engine::new(ctx, token_lists, params).run()
}

/// Single-prompt variant: the same engine with one slot and the prefix step
/// degenerated to a plain prompt feed.
pub fn generate(
    ctx: &mut LlamaContext,
    prompt: &str,
    params: &GenerateParams,
) -> Result<String, EngineError> {
    let prompts = [prompt.to_string()];
    let mut results = generate_parallel(ctx, &prompts, params)?;
    results
        .pop()
        .ok_or_else(|| EngineError::Generation("result vector came back empty".to_string()))
}

/// Run the engine on the blocking pool, building the context inside the task.
pub async fn generate_parallel_async(
    backend: &LlamaBackend,
    model: &LlamaModel,
    config: &ContextConfig,
    prompts: Vec<String>,
    params: GenerateParams,
) -> eyre::Result<Vec<String>> {
    // Safety: transmute only to satisfy `spawn_blocking`'s `'static` bound.
    // We assume that:
    // * we await the `JoinHandle` before either reference can drop;
    // * the closure does not store or spawn further tasks;
    // * the context lives and dies inside the closure.
    // If this changes, this should be inside an `Arc` instead of `transmute`.
    let also_backend = unsafe { std::mem::transmute::<&_, &'static LlamaBackend>(backend) };
    let also_model = unsafe { std::mem::transmute::<&_, &'static LlamaModel>(model) };
    let config = config.clone();
    let task = tokio::task::spawn_blocking(move || -> eyre::Result<Vec<String>> {
        let mut ctx = runtime::new_context(also_backend, also_model, &config)?;
        Ok(generate_parallel(&mut ctx, &prompts, &params)?)
    });
    task.await.map_err(|e| eyre!(e))?
}

struct Engine<'e, 'm> {
    ctx: &'e mut LlamaContext<'m>,
    params: &'e GenerateParams,
    /// Effective seed, shared by every slot of this call.
    seed: u32,
    max_tokens: usize,
    /// Tokenised prompts; each entry is taken exactly once at admission.
    prompts: Vec<Vec<LlamaToken>>,
    shared_len: usize,
    prefix_ready: bool,
    slots: Vec<Slot>,
    queue: VecDeque<usize>,
    results: Vec<Option<String>>,
    driver: BatchDriver,
    progress: Progress,
}

impl<'e, 'm> Engine<'e, 'm> {
    fn new(
        ctx: &'e mut LlamaContext<'m>,
        prompts: Vec<Vec<LlamaToken>>,
        params: &'e GenerateParams,
    ) -> Self {
        let n_prompts = prompts.len();
        let n_slots = params.n_parallel.max(1).min(n_prompts);
        let shared_len = prefix::shared_prefix_len(&prompts);
        let driver = BatchDriver::new(ctx);
        Engine {
            seed: sampling::resolve_seed(params.seed),
            max_tokens: params.max_tokens,
            shared_len,
            prefix_ready: false,
            slots: (1..=n_slots as i32).map(Slot::new).collect(),
            queue: (0..n_prompts).collect(),
            results: vec![None; n_prompts],
            driver,
            progress: Progress::new(n_prompts, params.show_progress),
            ctx,
            params,
            prompts,
        }
    }

    fn run(mut self) -> Result<Vec<String>, EngineError> {
        let outcome = self.drive();
        self.progress.finish();
        // The memory never outlives the call, success or not.
        kv::clear(self.ctx);
        tracing::debug!(
            cache_misses = self.driver.cache_misses,
            ok = outcome.is_ok(),
            "parallel generation done"
        );
        outcome?;
        Ok(self
            .results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| "[ERROR] prompt was never scheduled".to_string()))
            .collect())
    }

    fn drive(&mut self) -> Result<(), EngineError> {
        self.warm_prefix()?;

        loop {
            self.fill_slots();

            // Retire streams that already exhausted their token budget
            // before spending a decode row on them.
            for k in 0..self.slots.len() {
                if self.slots[k].active && self.slots[k].n_decoded >= self.max_tokens {
                    self.finish_slot(k);
                }
            }

            let rows = self.assemble();
            if rows.is_empty() {
                if self.queue.is_empty() {
                    break;
                }
                continue;
            }

            let outcome = {
                let Engine {
                    ctx,
                    driver,
                    slots,
                    params,
                    max_tokens,
                    ..
                } = self;
                let params: &GenerateParams = *params;
                let max_tokens = *max_tokens;
                driver.submit(&mut **ctx, &rows, |ctx, range| {
                    // Slot-index order keeps fixed-seed runs bit-for-bit
                    // reproducible.
                    for slot in slots.iter_mut() {
                        if !slot.active || slot.failed || slot.i_batch < 0 {
                            continue;
                        }
                        let row = slot.i_batch as usize;
                        if row < range.start || row >= range.end {
                            continue;
                        }
                        step_slot(ctx, slot, (row - range.start) as i32, params, max_tokens);
                    }
                    Ok(())
                })
            };

            match outcome {
                Ok(SubmitOutcome::Ok) => {}
                Ok(SubmitOutcome::Exhausted) => {
                    // Rows past the refused window still carry a batch index;
                    // fail their owners and keep the rest going.
                    for k in 0..self.slots.len() {
                        if self.slots[k].active && self.slots[k].i_batch >= 0 {
                            self.slots[k].i_batch = -1;
                            self.fail_slot(k, "decode refused even at chunk size 1 (no KV slot)");
                        }
                    }
                }
                Err(e) => return Err(e),
            }

            for k in 0..self.slots.len() {
                if !self.slots[k].active {
                    continue;
                }
                if self.slots[k].failed {
                    let msg = self.slots[k]
                        .error
                        .take()
                        .unwrap_or_else(|| "generation failed".to_string());
                    self.fail_slot(k, &msg);
                } else if self.slots[k].finished {
                    self.finish_slot(k);
                }
            }
        }

        if self.prefix_ready {
            kv::remove_seq(self.ctx, kv::PREFIX_SEQ);
        }
        Ok(())
    }

    /// Decode the shared prefix once under seq-id 0. A soft refusal merely
    /// disables prefix reuse; only a fatal decode aborts the call.
    fn warm_prefix(&mut self) -> Result<(), EngineError> {
        kv::clear(self.ctx);
        let n_ctx = self.ctx.n_ctx() as usize;
        if self.shared_len == 0 || self.shared_len > n_ctx.saturating_sub(CONTEXT_HEADROOM) {
            return Ok(());
        }
        let rows: Vec<BatchRow> = self.prompts[0][..self.shared_len]
            .iter()
            .enumerate()
            .map(|(i, &t)| BatchRow {
                token: t,
                pos: i as i32,
                seq_id: kv::PREFIX_SEQ,
                logits: i + 1 == self.shared_len,
            })
            .collect();
        match self.driver.submit(self.ctx, &rows, |_, _| Ok(())) {
            Ok(SubmitOutcome::Ok) => {
                self.prefix_ready = true;
                tracing::debug!(len = self.shared_len, "shared prefix warmed");
            }
            Ok(SubmitOutcome::Exhausted) => {
                kv::clear(self.ctx);
                self.prefix_ready = false;
                tracing::warn!("could not warm the shared prefix, falling back to full prompts");
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Re-fill empty slots from the pending queue. An admission failure
    /// consumes the prompt (its sentinel is written) and the next queue entry
    /// is tried.
    fn fill_slots(&mut self) {
        for k in 0..self.slots.len() {
            if self.slots[k].active {
                continue;
            }
            while let Some(idx) = self.queue.pop_front() {
                match self.admit(k, idx) {
                    Ok(()) => break,
                    Err(msg) => {
                        self.results[idx] = Some(format!("[ERROR] {msg}"));
                        self.progress.tick();
                        tracing::debug!(prompt = idx, %msg, "admission rejected");
                    }
                }
            }
        }
    }

    /// Bind prompt `idx` to empty slot `k`: clone the warmed prefix, feed the
    /// uncovered prompt tail, arm the sampler. `Err` carries the sentinel
    /// message and leaves the slot empty.
    fn admit(&mut self, k: usize, idx: usize) -> Result<(), String> {
        let tokens = std::mem::take(&mut self.prompts[idx]);
        let Some(&last) = tokens.last() else {
            return Err("prompt produced no tokens".to_string());
        };
        let n_ctx = self.ctx.n_ctx() as usize;
        if tokens.len() > n_ctx.saturating_sub(CONTEXT_HEADROOM) {
            return Err(format!(
                "prompt of {} tokens does not fit the context window of {n_ctx} \
                 ({CONTEXT_HEADROOM} positions reserved for generation)",
                tokens.len()
            ));
        }

        // The final prompt token is withheld from the reused prefix so every
        // slot has a row to sample from in its first generation batch.
        let prefix_len = if self.prefix_ready {
            self.shared_len.min(tokens.len() - 1)
        } else {
            0
        };
        let seq_id = self.slots[k].seq_id;
        if prefix_len > 0 {
            if let Err(e) = kv::copy_prefix(self.ctx, seq_id, prefix_len) {
                kv::remove_seq(self.ctx, seq_id);
                return Err(format!("prefix reuse failed: {e}"));
            }
        }

        let sampler = sampling::slot_sampler(self.params, self.seed, &tokens);
        self.slots[k].arm(idx, tokens, last, prefix_len, sampler);

        let rows: Vec<BatchRow> = {
            let suffix = self.slots[k].suffix();
            suffix
                .iter()
                .enumerate()
                .map(|(j, &t)| BatchRow {
                    token: t,
                    pos: (prefix_len + j) as i32,
                    seq_id,
                    logits: j + 1 == suffix.len(),
                })
                .collect()
        };
        if !rows.is_empty() {
            match self.driver.submit(self.ctx, &rows, |_, _| Ok(())) {
                Ok(SubmitOutcome::Ok) => {}
                Ok(SubmitOutcome::Exhausted) => {
                    kv::remove_seq(self.ctx, seq_id);
                    self.slots[k].release();
                    return Err("prompt could not be decoded (no KV slot)".to_string());
                }
                Err(e) => {
                    kv::remove_seq(self.ctx, seq_id);
                    self.slots[k].release();
                    return Err(e.to_string());
                }
            }
        }
        tracing::trace!(
            slot = k,
            prompt = idx,
            n_tokens = self.slots[k].tokens.len(),
            prefix_len,
            "slot armed"
        );
        Ok(())
    }

    /// One row per active slot: its last accepted token at the next position,
    /// logits requested.
    fn assemble(&mut self) -> Vec<BatchRow> {
        let mut rows = Vec::new();
        for slot in self.slots.iter_mut().filter(|s| s.active && !s.failed) {
            slot.i_batch = rows.len() as i32;
            rows.push(BatchRow {
                token: slot.sampled,
                pos: (slot.n_past + slot.n_decoded) as i32,
                seq_id: slot.seq_id,
                logits: true,
            });
        }
        rows
    }

    /// Successful terminal transition: scrub, store, release, tick.
    fn finish_slot(&mut self, k: usize) {
        let (idx, raw) = {
            let slot = &mut self.slots[k];
            kv::remove_seq(self.ctx, slot.seq_id);
            (slot.global_index, std::mem::take(&mut slot.response))
        };
        self.slots[k].release();
        self.results[idx] = Some(scrub::clean(&String::from_utf8_lossy(&raw)));
        self.progress.tick();
        tracing::trace!(slot = k, prompt = idx, "slot finished");
    }

    /// Failed terminal transition: sentinel, release, tick.
    fn fail_slot(&mut self, k: usize, message: &str) {
        let idx = {
            let slot = &self.slots[k];
            kv::remove_seq(self.ctx, slot.seq_id);
            slot.global_index
        };
        self.slots[k].release();
        self.results[idx] = Some(format!("[ERROR] {message}"));
        self.progress.tick();
        tracing::debug!(slot = k, prompt = idx, %message, "slot failed");
    }
}

/// One sampling step for a slot whose logits row just became live. Per-slot
/// problems are recorded on the slot, never raised.
fn step_slot(
    ctx: &mut LlamaContext,
    slot: &mut Slot,
    row_in_window: i32,
    params: &GenerateParams,
    max_tokens: usize,
) {
    slot.i_batch = -1;
    let Some(sampler) = slot.sampler.as_mut() else {
        return;
    };
    let t = sampler.sample(ctx, row_in_window);
    // Keep repetition penalties coherent with the accepted stream.
    sampler.accept(t);
    slot.note(t);

    if ctx.model.is_eog_token(t) {
        // The terminator itself is never part of the response.
        slot.finished = true;
        return;
    }
    if params.control_stops.matches(&slot.recent) {
        stop::retract_control_suffix(ctx.model, &slot.recent, &mut slot.response);
        slot.finished = true;
        return;
    }
    match ctx.model.token_to_bytes(t, Special::Tokenize) {
        Ok(bytes) => slot.response.extend_from_slice(&bytes),
        Err(e) => {
            slot.fail(format!("detokenisation failed: {e}"));
            return;
        }
    }
    slot.n_decoded += 1;
    slot.sampled = t;
    if slot.n_decoded >= max_tokens {
        slot.finished = true;
        return;
    }
    if slot.n_decoded >= TURN_MARKER_WARMUP && stop::hit_turn_marker(&slot.response) {
        // The marker stays in the response; the output cleaner removes it.
        slot.finished = true;
    }
}

mod tests;
