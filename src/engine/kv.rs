//! KV memory lifecycle: full clears, prefix cloning, per-sequence removal.
//!
//! Seq-id 0 holds the shared prefix; slot `k` owns seq-id `k + 1`. These
//! three operations are the only sanctioned mutation path into the cache.

use gg::context::LlamaContext;

use super::EngineError;

/// Sequence id reserved for the shared prompt prefix.
pub(crate) const PREFIX_SEQ: i32 = 0;

/// Drop every KV entry across all sequences.
pub(crate) fn clear(ctx: &mut LlamaContext) {
    ctx.clear_kv_cache();
}

/// Clone the warmed rows `[0, upto)` from the prefix sequence onto `dst`, so
/// a subsequent decode under `dst` continues from position `upto`.
pub(crate) fn copy_prefix(ctx: &mut LlamaContext, dst: i32, upto: usize) -> Result<(), EngineError> {
    ctx.copy_kv_cache_seq(PREFIX_SEQ, dst, Some(0), Some(upto as u32))
        .map_err(|e| EngineError::Generation(format!("kv prefix copy failed: {e}")))
}

/// Drop every row owned by `seq`. A no-op on an already-empty range.
pub(crate) fn remove_seq(ctx: &mut LlamaContext, seq: i32) {
    if seq < 0 {
        return;
    }
    if let Err(e) = ctx.clear_kv_cache_seq(Some(seq as u32), None, None) {
        tracing::warn!(seq, %e, "kv removal failed");
    }
}
