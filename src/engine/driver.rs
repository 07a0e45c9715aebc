//! Adaptive chunked batch submission with KV back-pressure handling.
//!
//! A submission walks its rows in contiguous windows of at most the current
//! chunk cap. A "no KV slot" refusal halves the cap and retries the same
//! window; the cap stays halved for the rest of the submission and resets at
//! the top of the next one.

use std::ops::Range;

use gg::DecodeError;
use gg::context::LlamaContext;
use gg::llama_batch::LlamaBatch;
use gg::token::LlamaToken;

use super::EngineError;

/// Chunk cap at the top of every submission, bounded by the context's batch
/// capacity.
const INITIAL_CHUNK_CAP: usize = 512;

/// One token row of an assembled submission. Positions are per seq-id.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchRow {
    pub token: LlamaToken,
    pub pos: i32,
    pub seq_id: i32,
    /// Whether the sampler will consume this row's logits.
    pub logits: bool,
}

/// Outcome of a whole submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubmitOutcome {
    /// Every window decoded.
    Ok,
    /// The runtime kept refusing even at chunk size 1; the remaining rows
    /// were never decoded.
    Exhausted,
}

pub(crate) struct BatchDriver {
    initial_cap: usize,
    batch: LlamaBatch,
    /// Times the runtime reported KV pressure and the chunk cap was halved.
    pub cache_misses: u64,
}

impl BatchDriver {
    pub fn new(ctx: &LlamaContext) -> Self {
        let initial_cap = (ctx.n_batch() as usize).min(INITIAL_CHUNK_CAP).max(1);
        BatchDriver {
            initial_cap,
            batch: LlamaBatch::new(initial_cap, 1),
            cache_misses: 0,
        }
    }

    /// Decode `rows` window by window. `after_window` runs after each
    /// successful decode while its logits are still live, receiving the row
    /// range just decoded.
    pub fn submit(
        &mut self,
        ctx: &mut LlamaContext,
        rows: &[BatchRow],
        mut after_window: impl FnMut(&mut LlamaContext, Range<usize>) -> Result<(), EngineError>,
    ) -> Result<SubmitOutcome, EngineError> {
        let mut cap = self.initial_cap;
        let mut start = 0usize;
        while start < rows.len() {
            let take = cap.min(rows.len() - start);
            self.batch.clear();
            for row in &rows[start..start + take] {
                self.batch
                    .add(row.token, row.pos, &[row.seq_id], row.logits)
                    .map_err(|e| EngineError::Generation(format!("batch assembly failed: {e}")))?;
            }
            match ctx.decode(&mut self.batch) {
                Ok(()) => {
                    after_window(ctx, start..start + take)?;
                    start += take;
                }
                Err(DecodeError::NoKvCacheSlot) => {
                    self.cache_misses += 1;
                    if cap == 1 {
                        tracing::warn!(start, "runtime refused a single-token window, giving up on this submission");
                        return Ok(SubmitOutcome::Exhausted);
                    }
                    cap /= 2;
                    tracing::debug!(cap, misses = self.cache_misses, "kv pressure, halving chunk cap");
                }
                Err(e) => {
                    return Err(EngineError::Generation(format!("decode failed: {e}")));
                }
            }
        }
        Ok(SubmitOutcome::Ok)
    }
}
