//! Priority estimators: pure valuation of eligible candidates.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::similarity::token_jaccard;
use crate::core::pool::{CandidatePool, ItemState};
use crate::core::traits::Estimator;
use crate::core::types::RunContext;

/// Identity valuation: each candidate is worth its best retrieval score.
#[derive(Debug, Clone, Copy, Default)]
pub struct BaselineEstimator;

impl Estimator for BaselineEstimator {
    fn value(&self, pool: &CandidatePool, _ctx: &RunContext) -> BTreeMap<String, f64> {
        pool.get_eligible()
            .into_iter()
            .map(|item| (item.doc_id.clone(), item.max_source()))
            .collect()
    }
}

/// Baseline plus a boost for candidates that look like the reranker's
/// winners so far.
///
/// Winners are reranked items scoring at least `winner_threshold`. The
/// boost is the best lexical similarity to any winner, scaled by
/// `boost_weight` and clamped to [0, 1] before being added to the baseline.
#[derive(Debug, Clone, Copy)]
pub struct SimilarityEstimator {
    pub winner_threshold: f64,
    pub boost_weight: f64,
}

impl Default for SimilarityEstimator {
    fn default() -> Self {
        Self {
            winner_threshold: 0.8,
            boost_weight: 1.0,
        }
    }
}

impl Estimator for SimilarityEstimator {
    fn value(&self, pool: &CandidatePool, _ctx: &RunContext) -> BTreeMap<String, f64> {
        let winners: Vec<&str> = pool
            .iter()
            .filter(|item| {
                item.state == ItemState::Reranked
                    && item.reranker_score.is_some_and(|s| s >= self.winner_threshold)
            })
            .map(|item| item.content.as_str())
            .collect();

        pool.get_eligible()
            .into_iter()
            .map(|item| {
                let baseline = item.max_source();
                let best = winners
                    .iter()
                    .map(|winner| token_jaccard(&item.content, winner))
                    .fold(0.0f64, f64::max);
                let boost = (best * self.boost_weight).clamp(0.0, 1.0);
                (item.doc_id.clone(), baseline + boost)
            })
            .collect()
    }
}

/// How a composite merges its sub-estimators' values per id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    Mean,
    Max,
    /// Per-id minimum; for gating estimators the most conservative vote
    /// wins.
    Pessimistic,
}

impl MergeRule {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "mean" => Some(Self::Mean),
            "max" => Some(Self::Max),
            "pessimistic" => Some(Self::Pessimistic),
            _ => None,
        }
    }
}

/// Runs a list of estimators in declaration order and merges their outputs.
/// Ids absent from a sub-estimator's output simply don't contribute to that
/// id's merge.
#[derive(Debug)]
pub struct CompositeEstimator {
    parts: Vec<Box<dyn Estimator>>,
    merge: MergeRule,
}

impl CompositeEstimator {
    pub fn new(parts: Vec<Box<dyn Estimator>>, merge: MergeRule) -> Self {
        Self { parts, merge }
    }
}

impl Estimator for CompositeEstimator {
    fn value(&self, pool: &CandidatePool, ctx: &RunContext) -> BTreeMap<String, f64> {
        let mut collected: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for part in &self.parts {
            for (doc_id, value) in part.value(pool, ctx) {
                collected.entry(doc_id).or_default().push(value);
            }
        }
        collected
            .into_iter()
            .map(|(doc_id, values)| {
                let merged = match self.merge {
                    MergeRule::Mean => values.iter().sum::<f64>() / values.len() as f64,
                    MergeRule::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    MergeRule::Pessimistic => {
                        values.iter().copied().fold(f64::INFINITY, f64::min)
                    }
                };
                (doc_id, merged)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::budget::RemainingView;
    use crate::core::types::ScoredDocument;
    use std::collections::BTreeMap;

    fn ctx() -> RunContext {
        RunContext::new("rag pipelines", RemainingView::default())
    }

    fn pool() -> CandidatePool {
        let mut pool = CandidatePool::new();
        pool.admit(
            &[
                ScoredDocument::new("d1", "retrieval augmented generation overview", 0.9),
                ScoredDocument::new("d2", "retrieval augmented generation in depth", 0.4),
                ScoredDocument::new("d3", "pizza dough hydration", 0.45),
            ],
            "original",
            0,
        );
        pool
    }

    #[test]
    fn baseline_returns_max_source_for_eligible() {
        let pool = pool();
        let values = BaselineEstimator.value(&pool, &ctx());
        assert_eq!(values["d1"], 0.9);
        assert_eq!(values["d3"], 0.45);
    }

    #[test]
    fn baseline_skips_non_candidates() {
        let mut pool = pool();
        pool.transition(&["d1".to_string()], ItemState::InFlight).unwrap();
        let values = BaselineEstimator.value(&pool, &ctx());
        assert!(!values.contains_key("d1"));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn similarity_boosts_lookalikes_of_winners() {
        let mut pool = pool();
        // d1 wins a rerank round with a high score.
        let batch = vec!["d1".to_string()];
        pool.transition(&batch, ItemState::InFlight).unwrap();
        let scores = BTreeMap::from([("d1".to_string(), 0.9)]);
        pool.update_scores(&scores, "cross_encoder", &batch).unwrap();

        let values = SimilarityEstimator::default().value(&pool, &ctx());
        // d2 shares most words with the winner, d3 shares none.
        assert!(values["d2"] > 0.4);
        assert!(values["d2"] > values["d3"]);
        assert_eq!(values["d3"], 0.45);
    }

    #[test]
    fn similarity_boost_is_bounded() {
        let mut pool = CandidatePool::new();
        pool.admit(
            &[
                ScoredDocument::new("w", "identical text", 0.5),
                ScoredDocument::new("c", "identical text", 0.5),
            ],
            "original",
            0,
        );
        let batch = vec!["w".to_string()];
        pool.transition(&batch, ItemState::InFlight).unwrap();
        pool.update_scores(
            &BTreeMap::from([("w".to_string(), 0.95)]),
            "cross_encoder",
            &batch,
        )
        .unwrap();

        let estimator = SimilarityEstimator {
            winner_threshold: 0.8,
            boost_weight: 10.0,
        };
        let values = estimator.value(&pool, &ctx());
        assert!(values["c"] <= 0.5 + 1.0);
    }

    #[test]
    fn composite_mean_and_max_and_pessimistic() {
        #[derive(Debug)]
        struct Fixed(f64);
        impl Estimator for Fixed {
            fn value(&self, pool: &CandidatePool, _ctx: &RunContext) -> BTreeMap<String, f64> {
                pool.get_eligible()
                    .into_iter()
                    .map(|item| (item.doc_id.clone(), self.0))
                    .collect()
            }
        }

        let pool = pool();
        for (rule, expected) in [
            (MergeRule::Mean, 0.5),
            (MergeRule::Max, 0.8),
            (MergeRule::Pessimistic, 0.2),
        ] {
            let composite =
                CompositeEstimator::new(vec![Box::new(Fixed(0.2)), Box::new(Fixed(0.8))], rule);
            let values = composite.value(&pool, &ctx());
            assert!((values["d1"] - expected).abs() < 1e-9, "{rule:?}");
        }
    }

    #[test]
    fn composite_estimation_is_deterministic() {
        let pool = pool();
        let composite = CompositeEstimator::new(
            vec![Box::new(BaselineEstimator), Box::new(SimilarityEstimator::default())],
            MergeRule::Mean,
        );
        let a = composite.value(&pool, &ctx());
        let b = composite.value(&pool, &ctx());
        assert_eq!(a, b);
    }
}
