//! Lexical similarity measures used by the similarity estimator and the
//! reformulation near-duplicate filter.

use std::collections::HashSet;

fn word_set(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_string())
        .collect()
}

/// Jaccard similarity over lowercased word sets, in [0, 1].
pub fn token_jaccard(a: &str, b: &str) -> f64 {
    let wa = word_set(a);
    let wb = word_set(b);
    if wa.is_empty() && wb.is_empty() {
        return 0.0;
    }
    let intersection = wa.intersection(&wb).count() as f64;
    let union = wa.union(&wb).count() as f64;
    intersection / union
}

fn bigram_set(text: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = text
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

/// Dice coefficient over case-folded character bigrams, in [0, 1].
///
/// Robust to small edits ("systems" vs "system"), which is what the
/// near-duplicate filter needs; word-level measures miss those.
pub fn bigram_dice(a: &str, b: &str) -> f64 {
    let ba = bigram_set(a);
    let bb = bigram_set(b);
    if ba.is_empty() || bb.is_empty() {
        return if a.trim().eq_ignore_ascii_case(b.trim()) {
            1.0
        } else {
            0.0
        };
    }
    let intersection = ba.intersection(&bb).count() as f64;
    2.0 * intersection / (ba.len() + bb.len()) as f64
}
