//! Longest common token prefix across a prompt batch.

use gg::token::LlamaToken;

/// Largest `L` such that every sequence starts with the same `L` tokens.
/// A lone sequence shares its full length with itself; any pair may share
/// nothing at all.
pub(crate) fn shared_prefix_len(lists: &[Vec<LlamaToken>]) -> usize {
    let Some(first) = lists.first() else {
        return 0;
    };
    let mut shared = first.len();
    for other in &lists[1..] {
        let common = first
            .iter()
            .zip(other.iter())
            .take_while(|(a, b)| a == b)
            .count();
        shared = shared.min(common);
        if shared == 0 {
            break;
        }
    }
    shared
}
