//! Batch-selection policies.

use crate::core::budget::{CostVector, RemainingView, RERANK_CALLS, RERANK_DOCS, TOKENS};
use crate::core::pool::{CandidatePool, ItemState, PoolItem};
use crate::core::traits::Scheduler;
use crate::core::types::BatchProposal;
use crate::tokens::count_tokens;

/// Cheap-tier strategy tag.
pub const STRATEGY_CROSS_ENCODER: &str = "cross_encoder";
/// Expensive-tier strategy tag.
pub const STRATEGY_LLM: &str = "llm";

/// Prompt overhead charged per document when estimating a token-metered
/// call.
const TOKEN_OVERHEAD_PER_DOC: usize = 32;

/// Priority-ordered top-k batching with optional tier escalation.
///
/// Candidates are ranked by priority, then first-seen rank, then id; the
/// batch is clamped to the remaining rerank-document headroom. Escalation
/// switches the strategy tag to the expensive tier once the candidate set
/// thins out or the reranked top-k looks confident; the controller never
/// interprets the tag.
#[derive(Debug, Clone)]
pub struct TopKScheduler {
    pub batch_size: usize,
    pub strategy: String,
    pub escalation_strategy: Option<String>,
    /// Escalate when fewer than this many candidates remain.
    pub escalate_min_eligible: Option<usize>,
    /// Escalate when every reranked item in the top-k scores at least this.
    pub escalate_confidence: Option<f64>,
    /// Width of the reranked top-k inspected for the confidence trigger.
    pub confidence_top_k: usize,
    /// Strategies whose expected cost includes a token estimate.
    pub token_metered_strategies: Vec<String>,
}

impl Default for TopKScheduler {
    fn default() -> Self {
        Self {
            batch_size: 5,
            strategy: STRATEGY_CROSS_ENCODER.to_string(),
            escalation_strategy: None,
            escalate_min_eligible: None,
            escalate_confidence: None,
            confidence_top_k: 3,
            token_metered_strategies: vec![STRATEGY_LLM.to_string()],
        }
    }
}

impl TopKScheduler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    /// Enable escalation to `strategy` with the given triggers.
    pub fn escalating(
        mut self,
        strategy: impl Into<String>,
        min_eligible: Option<usize>,
        confidence: Option<f64>,
    ) -> Self {
        self.escalation_strategy = Some(strategy.into());
        self.escalate_min_eligible = min_eligible;
        self.escalate_confidence = confidence;
        self
    }

    fn should_escalate(&self, pool: &CandidatePool, eligible_count: usize) -> bool {
        if self.escalation_strategy.is_none() {
            return false;
        }
        if let Some(min) = self.escalate_min_eligible {
            if eligible_count < min {
                return true;
            }
        }
        if let Some(threshold) = self.escalate_confidence {
            let mut reranked: Vec<f64> = pool
                .iter()
                .filter(|item| item.state == ItemState::Reranked)
                .filter_map(|item| item.reranker_score)
                .collect();
            reranked.sort_by(|a, b| b.total_cmp(a));
            reranked.truncate(self.confidence_top_k);
            if reranked.len() >= self.confidence_top_k
                && reranked.iter().all(|s| *s >= threshold)
            {
                return true;
            }
        }
        false
    }

    fn expected_cost(&self, batch: &[&PoolItem], strategy: &str) -> CostVector {
        let mut cost = CostVector::new()
            .with(RERANK_DOCS, batch.len() as f64)
            .with(RERANK_CALLS, 1.0);
        if self.token_metered_strategies.iter().any(|s| s == strategy) {
            let tokens: usize = batch
                .iter()
                .map(|item| count_tokens(&item.content) + TOKEN_OVERHEAD_PER_DOC)
                .sum();
            cost = cost.with(TOKENS, tokens as f64);
        }
        cost
    }
}

impl Scheduler for TopKScheduler {
    fn select_batch(&self, pool: &CandidatePool, view: &RemainingView) -> Option<BatchProposal> {
        if !view.has_any(RERANK_CALLS) {
            return None;
        }

        let mut eligible = pool.get_eligible();
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by(|a, b| {
            b.priority_value
                .total_cmp(&a.priority_value)
                .then_with(|| a.initial_rank.cmp(&b.initial_rank))
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });

        let doc_headroom = view
            .remaining(RERANK_DOCS)
            .map(|r| r.floor() as usize)
            .unwrap_or(usize::MAX);
        let size = self.batch_size.min(eligible.len()).min(doc_headroom);
        if size == 0 {
            return None;
        }

        let strategy = if self.should_escalate(pool, eligible.len()) {
            self.escalation_strategy
                .clone()
                .unwrap_or_else(|| self.strategy.clone())
        } else {
            self.strategy.clone()
        };

        let batch = &eligible[..size];
        let expected_cost = self.expected_cost(batch, &strategy);
        let estimated_utility =
            batch.iter().map(|item| item.priority_value).sum::<f64>() / size as f64;

        Some(BatchProposal {
            doc_ids: batch.iter().map(|item| item.doc_id.clone()).collect(),
            strategy,
            expected_cost,
            estimated_utility,
        })
    }
}

/// Polls sub-schedulers in declaration order; the first proposal wins.
#[derive(Debug)]
pub struct CompositeScheduler {
    parts: Vec<Box<dyn Scheduler>>,
}

impl CompositeScheduler {
    pub fn new(parts: Vec<Box<dyn Scheduler>>) -> Self {
        Self { parts }
    }
}

impl Scheduler for CompositeScheduler {
    fn select_batch(&self, pool: &CandidatePool, view: &RemainingView) -> Option<BatchProposal> {
        self.parts
            .iter()
            .find_map(|part| part.select_batch(pool, view))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::{CostBudget, CostTracker};
    use crate::core::types::ScoredDocument;
    use std::collections::BTreeMap;

    fn pool_of(docs: &[(&str, f64)]) -> CandidatePool {
        let mut pool = CandidatePool::new();
        let docs: Vec<ScoredDocument> = docs
            .iter()
            .map(|(id, score)| ScoredDocument::new(*id, format!("text {id}"), *score))
            .collect();
        pool.admit(&docs, "original", 0);
        let priorities: BTreeMap<String, f64> =
            docs.iter().map(|d| (d.id.clone(), d.score)).collect();
        pool.apply_priorities(&priorities);
        pool
    }

    fn view(limits: &[(&str, f64)]) -> RemainingView {
        let mut budget = CostBudget::unbounded();
        for (resource, limit) in limits {
            budget = budget.with_limit(*resource, *limit);
        }
        CostTracker::new(budget).remaining_view()
    }

    #[test]
    fn batch_is_priority_ordered() {
        let pool = pool_of(&[("a", 0.2), ("b", 0.9), ("c", 0.5)]);
        let proposal = TopKScheduler::new(2)
            .select_batch(&pool, &view(&[]))
            .unwrap();
        assert_eq!(proposal.doc_ids, vec!["b", "c"]);
        assert_eq!(proposal.strategy, STRATEGY_CROSS_ENCODER);
        assert_eq!(proposal.expected_cost.get(RERANK_DOCS), 2.0);
        assert_eq!(proposal.expected_cost.get(RERANK_CALLS), 1.0);
    }

    #[test]
    fn priority_tie_breaks_by_rank_then_id() {
        let mut pool = CandidatePool::new();
        pool.admit(
            &[
                ScoredDocument::new("z", "t", 0.5),
                ScoredDocument::new("a", "t", 0.5),
            ],
            "original",
            0,
        );
        let proposal = TopKScheduler::new(2)
            .select_batch(&pool, &view(&[]))
            .unwrap();
        // Equal priority: "z" was retrieved first.
        assert_eq!(proposal.doc_ids, vec!["z", "a"]);
    }

    #[test]
    fn batch_clamped_to_remaining_docs() {
        let pool = pool_of(&[("a", 0.9), ("b", 0.8), ("c", 0.7)]);
        let proposal = TopKScheduler::new(2)
            .select_batch(&pool, &view(&[(RERANK_DOCS, 1.0)]))
            .unwrap();
        assert_eq!(proposal.doc_ids, vec!["a"]);
    }

    #[test]
    fn no_proposal_when_nothing_eligible_or_no_headroom() {
        let scheduler = TopKScheduler::new(2);
        let empty = CandidatePool::new();
        assert!(scheduler.select_batch(&empty, &view(&[])).is_none());

        let pool = pool_of(&[("a", 0.9)]);
        assert!(scheduler
            .select_batch(&pool, &view(&[(RERANK_DOCS, 0.0)]))
            .is_none());
        assert!(scheduler
            .select_batch(&pool, &view(&[(RERANK_CALLS, 0.0)]))
            .is_none());
    }

    #[test]
    fn escalates_when_few_candidates_remain() {
        let pool = pool_of(&[("a", 0.9), ("b", 0.8)]);
        let scheduler =
            TopKScheduler::new(2).escalating(STRATEGY_LLM, Some(3), None);
        let proposal = scheduler.select_batch(&pool, &view(&[])).unwrap();
        assert_eq!(proposal.strategy, STRATEGY_LLM);
        // The LLM tier is token-metered.
        assert!(proposal.expected_cost.get(TOKENS) > 0.0);
    }

    #[test]
    fn escalates_when_reranked_topk_is_confident() {
        let mut pool = pool_of(&[("a", 0.9), ("b", 0.8), ("c", 0.7), ("d", 0.6), ("e", 0.5)]);
        let batch: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        pool.transition(&batch, ItemState::InFlight).unwrap();
        let scores = BTreeMap::from([
            ("a".to_string(), 0.95),
            ("b".to_string(), 0.93),
            ("c".to_string(), 0.91),
        ]);
        pool.update_scores(&scores, STRATEGY_CROSS_ENCODER, &batch).unwrap();

        let mut scheduler =
            TopKScheduler::new(2).escalating(STRATEGY_LLM, None, Some(0.9));
        scheduler.confidence_top_k = 3;
        let proposal = scheduler.select_batch(&pool, &view(&[])).unwrap();
        assert_eq!(proposal.strategy, STRATEGY_LLM);

        // Below the threshold, the cheap tier is kept.
        scheduler.escalate_confidence = Some(0.99);
        let proposal = scheduler.select_batch(&pool, &view(&[])).unwrap();
        assert_eq!(proposal.strategy, STRATEGY_CROSS_ENCODER);
    }

    #[test]
    fn composite_takes_first_proposal() {
        #[derive(Debug)]
        struct Never;
        impl Scheduler for Never {
            fn select_batch(
                &self,
                _pool: &CandidatePool,
                _view: &RemainingView,
            ) -> Option<BatchProposal> {
                None
            }
        }

        let pool = pool_of(&[("a", 0.9)]);
        let composite = CompositeScheduler::new(vec![
            Box::new(Never),
            Box::new(TopKScheduler::new(1)),
        ]);
        let proposal = composite.select_batch(&pool, &view(&[])).unwrap();
        assert_eq!(proposal.doc_ids, vec!["a"]);
    }
}
