//! Per-stream slot state.
//!
//! A slot is one of the engine's fixed concurrent streams. Its seq-id is
//! assigned at construction and never changes; everything else is reset on
//! each admission and wiped again by `release`.

use std::collections::VecDeque;

use gg::sampling::LlamaSampler;
use gg::token::LlamaToken;

use super::stop::EOG_WINDOW;

pub(crate) struct Slot {
    /// KV sequence this slot owns for the duration of a call.
    pub seq_id: i32,
    pub active: bool,
    /// Reached a clean stop; awaiting finalisation.
    pub finished: bool,
    /// Hit a per-slot error; awaiting finalisation with a sentinel.
    pub failed: bool,
    /// Index into the caller's prompt vector.
    pub global_index: usize,
    pub tokens: Vec<LlamaToken>,
    /// Leading tokens reused from the warmed shared prefix.
    pub prefix_len: usize,
    /// Positions already decoded under `seq_id` before generation started.
    pub n_past: usize,
    pub n_decoded: usize,
    /// Row index in the in-flight batch, -1 when none.
    pub i_batch: i32,
    /// Last accepted token; fed back on the next iteration.
    pub sampled: LlamaToken,
    pub sampler: Option<LlamaSampler>,
    /// Accumulated response bytes; converted to text at finalisation.
    pub response: Vec<u8>,
    /// Sliding window of the last accepted tokens, newest last.
    pub recent: VecDeque<LlamaToken>,
    pub error: Option<String>,
}

impl Slot {
    pub fn new(seq_id: i32) -> Self {
        Slot {
            seq_id,
            active: false,
            finished: false,
            failed: false,
            global_index: 0,
            tokens: Vec::new(),
            prefix_len: 0,
            n_past: 0,
            n_decoded: 0,
            i_batch: -1,
            sampled: LlamaToken::new(0),
            sampler: None,
            response: Vec::new(),
            recent: VecDeque::with_capacity(EOG_WINDOW),
            error: None,
        }
    }

    /// Admission: take ownership of the prompt and arm the stream. The final
    /// prompt token becomes `sampled` and rides the first generation batch,
    /// so `n_past` excludes it.
    pub fn arm(
        &mut self,
        global_index: usize,
        tokens: Vec<LlamaToken>,
        last: LlamaToken,
        prefix_len: usize,
        sampler: LlamaSampler,
    ) {
        self.active = true;
        self.finished = false;
        self.failed = false;
        self.global_index = global_index;
        self.prefix_len = prefix_len;
        self.n_past = tokens.len().saturating_sub(1);
        self.n_decoded = 0;
        self.i_batch = -1;
        self.sampled = last;
        self.tokens = tokens;
        self.sampler = Some(sampler);
        self.response.clear();
        self.recent.clear();
        self.error = None;
    }

    /// Prompt tail not covered by the shared prefix, minus the withheld final
    /// token.
    pub fn suffix(&self) -> &[LlamaToken] {
        &self.tokens[self.prefix_len..self.tokens.len().saturating_sub(1)]
    }

    /// Record an accepted token in the EOG window.
    pub fn note(&mut self, t: LlamaToken) {
        if self.recent.len() == EOG_WINDOW {
            self.recent.pop_front();
        }
        self.recent.push_back(t);
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.failed = true;
        self.error = Some(message.into());
    }

    /// Terminal transition: drop the sampler and free the slot for
    /// reassignment.
    pub fn release(&mut self) {
        self.active = false;
        self.finished = false;
        self.failed = false;
        self.tokens = Vec::new();
        self.prefix_len = 0;
        self.n_past = 0;
        self.n_decoded = 0;
        self.i_batch = -1;
        self.sampler = None;
        self.response = Vec::new();
        self.recent.clear();
        self.error = None;
    }
}
