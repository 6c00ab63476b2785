//! Token counting for cost estimates and context assembly.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static BPE: Lazy<CoreBPE> = Lazy::new(|| cl100k_base().expect("Failed to load cl100k_base tokenizer"));

/// Count tokens in text using the cl100k_base tokenizer.
pub fn count_tokens(text: &str) -> usize {
    BPE.encode_with_special_tokens(text).len()
}
