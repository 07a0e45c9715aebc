#![cfg(test)]

use std::collections::VecDeque;

use gg::sampling::LlamaSampler;
use gg::token::LlamaToken;

use super::prefix::shared_prefix_len;
use super::scrub;
use super::slot::Slot;
use super::stop::{self, ControlStops, EOG_WINDOW};
use crate::sampling::resolve_seed;

fn toks(ids: &[i32]) -> Vec<LlamaToken> {
    ids.iter().map(|&i| LlamaToken::new(i)).collect()
}

fn window(ids: &[i32]) -> VecDeque<LlamaToken> {
    ids.iter().map(|&i| LlamaToken::new(i)).collect()
}

#[test]
fn prefix_of_one_prompt_is_the_whole_prompt() {
    assert_eq!(shared_prefix_len(&[toks(&[1, 2, 3])]), 3);
}

#[test]
fn prefix_is_the_shortest_common_run() {
    let lists = [toks(&[7, 8, 9, 10]), toks(&[7, 8, 11]), toks(&[7, 8, 9])];
    assert_eq!(shared_prefix_len(&lists), 2);
}

#[test]
fn prefix_can_be_zero() {
    assert_eq!(shared_prefix_len(&[toks(&[1, 2]), toks(&[3, 4])]), 0);
    assert_eq!(shared_prefix_len(&[toks(&[1, 2]), toks(&[])]), 0);
}

#[test]
fn prefix_of_identical_prompts_is_full_length() {
    let lists = [toks(&[5, 6, 7]), toks(&[5, 6, 7])];
    assert_eq!(shared_prefix_len(&lists), 3);
}

#[test]
fn scrub_removes_template_markers() {
    assert_eq!(
        scrub::clean("<|im_start|>assistant says hi<|im_end|>"),
        "assistant says hi"
    );
    assert_eq!(scrub::clean("fine<|endoftext|>"), "fine");
}

#[test]
fn scrub_catches_markers_exposed_by_earlier_passes() {
    // Removing "</s>" from "<</s>s>" leaves "<s>", gone on the next pass.
    assert_eq!(scrub::clean("ok<</s>s>"), "ok");
}

#[test]
fn scrub_trims_control_bytes_and_trailing_whitespace() {
    assert_eq!(scrub::clean("\u{1}\u{2}hello there  \n"), "hello there");
}

#[test]
fn scrub_truncates_at_conversation_turn() {
    assert_eq!(scrub::clean("42.\n\nUser: next question"), "42.");
    assert_eq!(scrub::clean("42.\n\nHuman: next question"), "42.");
}

#[test]
fn control_stops_need_a_full_window() {
    let stops = ControlStops::new(vec![[1, 2, 3, 4, 5, 6, 7]]);
    assert!(!stops.matches(&window(&[1, 2, 3, 4, 5, 6])));
    assert!(stops.matches(&window(&[1, 2, 3, 4, 5, 6, 7])));
    assert!(!stops.matches(&window(&[1, 2, 3, 4, 5, 6, 8])));
}

#[test]
fn empty_table_never_matches() {
    let stops = ControlStops::default();
    assert!(stops.is_empty());
    assert!(!stops.matches(&window(&[0; EOG_WINDOW])));
}

#[test]
fn suffix_strip_requires_an_exact_tail() {
    let mut response = b"answer<end".to_vec();
    stop::strip_suffix_bytes(&mut response, b"<end");
    assert_eq!(response, b"answer");

    // A partial overlap with text that was already cleaned away must not
    // strip anything.
    let mut response = b"answer<e".to_vec();
    stop::strip_suffix_bytes(&mut response, b"<end");
    assert_eq!(response, b"answer<e");

    let mut response = b"answer".to_vec();
    stop::strip_suffix_bytes(&mut response, b"");
    assert_eq!(response, b"answer");
}

#[test]
fn turn_markers_are_found_mid_response() {
    assert!(stop::hit_turn_marker(b"done.\n\nUser: more"));
    assert!(stop::hit_turn_marker(b"done.\n\nHuman: more"));
    assert!(!stop::hit_turn_marker(b"done."));
    assert!(!stop::hit_turn_marker(b"\n\nUse"));
}

#[test]
fn arming_withholds_the_final_prompt_token() {
    let mut slot = Slot::new(1);
    let tokens = toks(&[10, 11, 12, 13]);
    slot.arm(2, tokens, LlamaToken::new(13), 2, LlamaSampler::greedy());

    assert!(slot.active);
    assert_eq!(slot.global_index, 2);
    assert_eq!(slot.n_past, 3);
    assert_eq!(slot.n_decoded, 0);
    assert_eq!(slot.sampled, LlamaToken::new(13));
    // Suffix covers positions between the reused prefix and the withheld
    // final token.
    assert_eq!(slot.suffix(), &toks(&[12])[..]);
    assert!(slot.sampler.is_some());
}

#[test]
fn fully_shared_prompt_has_an_empty_suffix() {
    let mut slot = Slot::new(1);
    slot.arm(
        0,
        toks(&[10, 11, 12]),
        LlamaToken::new(12),
        2,
        LlamaSampler::greedy(),
    );
    assert!(slot.suffix().is_empty());
}

#[test]
fn recent_window_holds_the_last_seven_tokens() {
    let mut slot = Slot::new(1);
    for i in 0..10 {
        slot.note(LlamaToken::new(i));
    }
    assert_eq!(slot.recent.len(), EOG_WINDOW);
    assert_eq!(slot.recent.front(), Some(&LlamaToken::new(3)));
    assert_eq!(slot.recent.back(), Some(&LlamaToken::new(9)));
}

#[test]
fn release_frees_the_sampler_and_the_stream() {
    let mut slot = Slot::new(3);
    slot.arm(
        0,
        toks(&[1, 2]),
        LlamaToken::new(2),
        0,
        LlamaSampler::greedy(),
    );
    slot.fail("boom");
    assert!(slot.failed);
    assert_eq!(slot.error.as_deref(), Some("boom"));

    slot.release();
    assert!(!slot.active);
    assert!(!slot.failed);
    assert!(slot.sampler.is_none());
    assert!(slot.error.is_none());
    assert_eq!(slot.seq_id, 3);
}

#[test]
fn non_negative_seeds_pass_through() {
    assert_eq!(resolve_seed(0), 0);
    assert_eq!(resolve_seed(31337), 31337);
}
