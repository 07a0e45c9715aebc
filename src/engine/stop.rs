//! End-of-generation detection beyond the vocabulary's own EOG flags.
//!
//! Chat-tuned models sometimes spell their end-of-turn marker as ordinary
//! sub-word tokens rather than one control token, so a second detection layer
//! watches a sliding window of the most recently accepted tokens.

use std::collections::VecDeque;

use gg::model::{LlamaModel, Special};
use gg::token::LlamaToken;
use serde::{Deserialize, Serialize};

/// Window length for multi-token control-sequence detection.
pub(crate) const EOG_WINDOW: usize = 7;

/// Conversation-turn markers that stop a stream once a few tokens exist.
pub(crate) const TURN_MARKERS: [&str; 2] = ["\n\nUser:", "\n\nHuman:"];

/// Token-id sequences that end a turn without any single token being EOG.
/// Entries are literal ids and therefore vocabulary-specific; hosts register
/// them per model.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlStops {
    sequences: Vec<[i32; EOG_WINDOW]>,
}

impl ControlStops {
    pub fn new(sequences: Vec<[i32; EOG_WINDOW]>) -> Self {
        ControlStops { sequences }
    }

    /// Track one more seven-token end-of-turn spelling.
    pub fn push(&mut self, sequence: [i32; EOG_WINDOW]) {
        self.sequences.push(sequence);
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.is_empty()
    }

    /// True when `recent` holds a full window and equals a tracked sequence,
    /// newest token last.
    pub(crate) fn matches(&self, recent: &VecDeque<LlamaToken>) -> bool {
        if recent.len() < EOG_WINDOW {
            return false;
        }
        self.sequences
            .iter()
            .any(|seq| recent.iter().zip(seq.iter()).all(|(t, id)| t.0 == *id))
    }
}

/// Undo the rendered text of the six tokens preceding the final control
/// token. They were appended before the window filled; stripping happens only
/// when the response still ends with exactly their bytes, so a partial match
/// crossing an earlier retraction boundary is left alone.
pub(crate) fn retract_control_suffix(
    model: &LlamaModel,
    recent: &VecDeque<LlamaToken>,
    response: &mut Vec<u8>,
) {
    let mut rendered = Vec::new();
    for &t in recent.iter().take(EOG_WINDOW - 1) {
        match model.token_to_bytes(t, Special::Tokenize) {
            Ok(bytes) => rendered.extend_from_slice(&bytes),
            // Cannot reproduce the byte suffix; leave the response alone.
            Err(_) => return,
        }
    }
    strip_suffix_bytes(response, &rendered);
}

/// Strip `suffix` off the end of `response` when it is exactly there.
pub(crate) fn strip_suffix_bytes(response: &mut Vec<u8>, suffix: &[u8]) {
    if !suffix.is_empty() && response.ends_with(suffix) {
        response.truncate(response.len() - suffix.len());
    }
}

/// True once the response contains a conversation-turn marker.
pub(crate) fn hit_turn_marker(response: &[u8]) -> bool {
    TURN_MARKERS
        .iter()
        .any(|m| contains_subslice(response, m.as_bytes()))
}

fn contains_subslice(haystack: &[u8], needle: &[u8]) -> bool {
    needle.len() <= haystack.len() && haystack.windows(needle.len()).any(|w| w == needle)
}
