//! Final response cleanup: template markers, stray control bytes, turn
//! truncation. Deterministic and independent of the model.

use super::stop::TURN_MARKERS;

/// Chat-template control markers scrubbed from final output.
const MARKERS: [&str; 8] = [
    "<|im_start|>",
    "<|im_end|>",
    "<start_of_turn>",
    "<end_of_turn>",
    "<s>",
    "</s>",
    "<|endoftext|>",
    "<|eot_id|>",
];

/// Removal can expose new markers ("<</s>s>" collapses to "<s>"), so the scan
/// repeats until a pass removes nothing, capped here.
const MAX_PASSES: usize = 5;

pub(crate) fn clean(raw: &str) -> String {
    let mut text = raw.to_string();
    for _ in 0..MAX_PASSES {
        let before = text.len();
        for marker in MARKERS {
            if text.contains(marker) {
                text = text.replace(marker, "");
            }
        }
        if text.len() == before {
            break;
        }
    }

    let mut text = text.trim_start_matches(char::is_control).to_string();
    for marker in TURN_MARKERS {
        if let Some(i) = text.find(marker) {
            text.truncate(i);
        }
    }
    text.truncate(text.trim_end().len());
    text
}
