//! Final context assembly.

use async_trait::async_trait;

use crate::core::budget::TOKENS;
use crate::core::traits::Assembler;
use crate::core::types::{RunContext, ScoredDocument};
use crate::tokens::count_tokens;

/// Walks the score-ordered items and keeps every document that still fits
/// the remaining token budget. Oversized documents are skipped, not
/// truncated, so a later smaller document can still make it in.
#[derive(Debug, Clone, Copy, Default)]
pub struct GreedyAssembler;

#[async_trait]
impl Assembler for GreedyAssembler {
    fn assemble(&self, items: Vec<ScoredDocument>, ctx: &RunContext) -> Vec<ScoredDocument> {
        let budget = ctx.budget.remaining(TOKENS);
        let mut used = 0.0f64;
        let mut selected = Vec::with_capacity(items.len());
        for doc in items {
            let cost = count_tokens(&doc.content) as f64;
            if let Some(limit) = budget {
                if used + cost > limit {
                    continue;
                }
            }
            used += cost;
            selected.push(doc);
        }
        selected
    }
}
