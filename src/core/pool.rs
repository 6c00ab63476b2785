//! Candidate pool: keyed registry of every document under consideration.
//!
//! The pool owns all per-document state for the request. Identity is the
//! doc id; once admitted, an id keeps its item for the request lifetime
//! (cap eviction right after admission is the one carve-out). Each item
//! moves through a strict state machine, and every multi-id operation is
//! atomic: it validates completely before mutating anything.

use std::collections::BTreeMap;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::PoolError;
use super::types::ScoredDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    /// Eligible for scheduling.
    Candidate,
    /// Currently moving through a reranker.
    InFlight,
    /// Final reranker score available.
    Reranked,
    /// Excluded from final results.
    Dropped,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemState::Candidate => "candidate",
            ItemState::InFlight => "in_flight",
            ItemState::Reranked => "reranked",
            ItemState::Dropped => "dropped",
        }
    }

    /// Legal-transitions table. Terminal states never return to
    /// `Candidate` or `InFlight`.
    pub fn can_transition_to(self, target: ItemState) -> bool {
        matches!(
            (self, target),
            (ItemState::Candidate, ItemState::InFlight)
                | (ItemState::Candidate, ItemState::Dropped)
                | (ItemState::InFlight, ItemState::Reranked)
                | (ItemState::InFlight, ItemState::Dropped)
                | (ItemState::Reranked, ItemState::Dropped)
        )
    }
}

/// Per-document work unit. One per distinct doc id in the request.
#[derive(Debug, Clone, Serialize)]
pub struct PoolItem {
    pub doc_id: String,
    pub content: String,
    pub metadata: BTreeMap<String, Value>,
    pub state: ItemState,
    /// Retrieval-round tag -> score observed in that round.
    pub sources: BTreeMap<String, f64>,
    /// Rank in the first round that saw this doc; deterministic tie-break.
    pub initial_rank: usize,
    /// Number of rounds in which this doc was retrieved.
    pub appearances_count: usize,
    /// Written only from estimator output.
    pub priority_value: f64,
    /// Written only from reranker output.
    pub reranker_score: Option<f64>,
    /// Strategy tag that produced the reranker score.
    pub reranker_strategy: Option<String>,
}

impl PoolItem {
    fn from_document(doc: &ScoredDocument, round_tag: &str, rank: usize) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(round_tag.to_string(), doc.score);
        Self {
            doc_id: doc.id.clone(),
            content: doc.content.clone(),
            metadata: doc.metadata.clone(),
            state: ItemState::Candidate,
            sources,
            initial_rank: rank,
            appearances_count: 1,
            priority_value: 0.0,
            reranker_score: None,
            reranker_strategy: None,
        }
    }

    pub fn max_source(&self) -> f64 {
        self.sources
            .values()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
            .max(0.0)
    }

    /// Precedence: reranker score, then positive estimator priority, then
    /// best retrieval score, then zero.
    pub fn final_score(&self) -> f64 {
        if let Some(score) = self.reranker_score {
            return score;
        }
        if self.priority_value > 0.0 {
            return self.priority_value;
        }
        if self.sources.is_empty() {
            0.0
        } else {
            self.max_source()
        }
    }
}

/// Result of one admission round.
#[derive(Debug, Default)]
pub struct AdmitOutcome {
    pub admitted: usize,
    pub merged: usize,
    pub evicted: Vec<String>,
}

/// Result of a multi-id transition.
#[derive(Debug, Default)]
pub struct TransitionOutcome {
    pub applied: Vec<String>,
    /// Ids never admitted; skipped, reported for a warning event.
    pub unknown: Vec<String>,
}

/// Result of applying a reranker's score map.
#[derive(Debug, Default)]
pub struct ScoreUpdateOutcome {
    pub reranked: Vec<String>,
    /// Expected ids the reranker did not return; dropped.
    pub dropped: Vec<String>,
    pub unknown: Vec<String>,
}

/// State-bucket counts, polled by feedback plugins.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub candidate: usize,
    pub in_flight: usize,
    pub reranked: usize,
    pub dropped: usize,
}

/// Exclusive owner of all pool items. O(1) lookup by doc id, insertion
/// order preserved for reproducibility.
#[derive(Debug, Default)]
pub struct CandidatePool {
    items: HashMap<String, PoolItem>,
    order: Vec<String>,
    max_size: Option<usize>,
}

impl CandidatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool with a size cap applied after each admission round.
    pub fn with_cap(max_size: usize) -> Self {
        Self {
            max_size: Some(max_size),
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, doc_id: &str) -> Option<&PoolItem> {
        self.items.get(doc_id)
    }

    /// Items for the given ids, in id order; unknown ids are skipped.
    pub fn get_items(&self, doc_ids: &[String]) -> Vec<&PoolItem> {
        doc_ids
            .iter()
            .filter_map(|id| self.items.get(id.as_str()))
            .collect()
    }

    /// All items in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PoolItem> {
        self.order.iter().filter_map(|id| self.items.get(id))
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            total: self.items.len(),
            ..PoolStats::default()
        };
        for item in self.items.values() {
            match item.state {
                ItemState::Candidate => stats.candidate += 1,
                ItemState::InFlight => stats.in_flight += 1,
                ItemState::Reranked => stats.reranked += 1,
                ItemState::Dropped => stats.dropped += 1,
            }
        }
        stats
    }

    /// Admit one retrieval round.
    ///
    /// New ids become `Candidate` items ranked `base_rank + offset`. An id
    /// seen in an earlier round merges provenance instead: the round's
    /// score is recorded (max kept on duplicate tags), the appearance count
    /// increments, and `initial_rank` takes the minimum. State is untouched
    /// by a merge.
    pub fn admit(
        &mut self,
        docs: &[ScoredDocument],
        round_tag: &str,
        base_rank: usize,
    ) -> AdmitOutcome {
        let mut outcome = AdmitOutcome::default();
        for (offset, doc) in docs.iter().enumerate() {
            let rank = base_rank + offset;
            match self.items.get_mut(&doc.id) {
                Some(item) => {
                    let entry = item.sources.entry(round_tag.to_string()).or_insert(doc.score);
                    if doc.score > *entry {
                        *entry = doc.score;
                    }
                    item.appearances_count += 1;
                    item.initial_rank = item.initial_rank.min(rank);
                    outcome.merged += 1;
                }
                None => {
                    self.items
                        .insert(doc.id.clone(), PoolItem::from_document(doc, round_tag, rank));
                    self.order.push(doc.id.clone());
                    outcome.admitted += 1;
                }
            }
        }
        outcome.evicted = self.enforce_cap();
        outcome
    }

    /// Evict candidates beyond the cap, keeping the best retrieval scores
    /// (ties to the lexically smaller id). Items already scheduled or
    /// scored are exempt.
    fn enforce_cap(&mut self) -> Vec<String> {
        let Some(cap) = self.max_size else {
            return Vec::new();
        };
        if self.items.len() <= cap {
            return Vec::new();
        }

        let mut ranked: Vec<(String, f64)> = self
            .items
            .values()
            .map(|item| (item.doc_id.clone(), item.max_source()))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut evicted = Vec::new();
        for (doc_id, _) in ranked.into_iter().skip(cap) {
            let state = self.items[&doc_id].state;
            if state != ItemState::Candidate {
                continue;
            }
            self.items.remove(&doc_id);
            self.order.retain(|id| id != &doc_id);
            evicted.push(doc_id);
        }
        evicted.sort();
        evicted
    }

    /// Move every id to `target`, validating the whole set first.
    ///
    /// Any illegal transition fails the call and mutates nothing. Unknown
    /// ids are skipped and reported.
    pub fn transition(
        &mut self,
        doc_ids: &[String],
        target: ItemState,
    ) -> Result<TransitionOutcome, PoolError> {
        let mut outcome = TransitionOutcome::default();
        for doc_id in doc_ids {
            match self.items.get(doc_id.as_str()) {
                None => outcome.unknown.push(doc_id.clone()),
                Some(item) => {
                    if !item.state.can_transition_to(target) {
                        return Err(PoolError::IllegalTransition {
                            doc_id: doc_id.clone(),
                            from: item.state,
                            to: target,
                        });
                    }
                    outcome.applied.push(doc_id.clone());
                }
            }
        }
        for doc_id in &outcome.applied {
            if let Some(item) = self.items.get_mut(doc_id.as_str()) {
                item.state = target;
            }
        }
        Ok(outcome)
    }

    /// Apply a reranker's score map to the in-flight batch.
    ///
    /// Every scored id must currently be `InFlight`; a known id in any
    /// other state is an illegal transition and nothing is mutated. After
    /// the score map is applied, expected ids still in flight (the
    /// reranker did not return them) are dropped. Ids never admitted are
    /// skipped and reported.
    pub fn update_scores(
        &mut self,
        scores: &BTreeMap<String, f64>,
        strategy: &str,
        expected_ids: &[String],
    ) -> Result<ScoreUpdateOutcome, PoolError> {
        let mut outcome = ScoreUpdateOutcome::default();
        for doc_id in scores.keys() {
            match self.items.get(doc_id.as_str()) {
                None => outcome.unknown.push(doc_id.clone()),
                Some(item) => {
                    if item.state != ItemState::InFlight {
                        return Err(PoolError::IllegalTransition {
                            doc_id: doc_id.clone(),
                            from: item.state,
                            to: ItemState::Reranked,
                        });
                    }
                }
            }
        }

        for (doc_id, score) in scores {
            if let Some(item) = self.items.get_mut(doc_id.as_str()) {
                item.reranker_score = Some(*score);
                item.reranker_strategy = Some(strategy.to_string());
                item.state = ItemState::Reranked;
                outcome.reranked.push(doc_id.clone());
            }
        }

        for doc_id in expected_ids {
            if let Some(item) = self.items.get_mut(doc_id.as_str()) {
                if item.state == ItemState::InFlight {
                    item.state = ItemState::Dropped;
                    outcome.dropped.push(doc_id.clone());
                }
            }
        }
        Ok(outcome)
    }

    /// Write estimator priorities. Only candidates are touched; anything
    /// else in the map is ignored, which keeps estimator output free of
    /// state effects.
    pub fn apply_priorities(&mut self, priorities: &BTreeMap<String, f64>) {
        for (doc_id, value) in priorities {
            if let Some(item) = self.items.get_mut(doc_id.as_str()) {
                if item.state == ItemState::Candidate {
                    item.priority_value = *value;
                }
            }
        }
    }

    /// Candidates in insertion order, for the scheduler.
    pub fn get_eligible(&self) -> Vec<&PoolItem> {
        self.iter()
            .filter(|item| item.state == ItemState::Candidate)
            .collect()
    }

    /// Candidates and reranked items, sorted by final score descending,
    /// then initial rank, then doc id.
    pub fn get_active_items(&self) -> Vec<&PoolItem> {
        let mut active: Vec<&PoolItem> = self
            .iter()
            .filter(|item| {
                matches!(item.state, ItemState::Candidate | ItemState::Reranked)
            })
            .collect();
        active.sort_by(|a, b| {
            b.final_score()
                .total_cmp(&a.final_score())
                .then_with(|| a.initial_rank.cmp(&b.initial_rank))
                .then_with(|| a.doc_id.cmp(&b.doc_id))
        });
        active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, score: f64) -> ScoredDocument {
        ScoredDocument::new(id, format!("content of {id}"), score)
    }

    fn pool_with(docs: &[(&str, f64)]) -> CandidatePool {
        let mut pool = CandidatePool::new();
        let docs: Vec<ScoredDocument> = docs.iter().map(|(id, s)| doc(id, *s)).collect();
        pool.admit(&docs, "original", 0);
        pool
    }

    #[test]
    fn admit_dedups_and_merges_provenance() {
        let mut pool = CandidatePool::new();
        pool.admit(&[doc("doc1", 0.9), doc("doc2", 0.8)], "original", 0);
        assert_eq!(pool.len(), 2);
        let d1 = pool.get("doc1").unwrap();
        assert_eq!(d1.sources["original"], 0.9);
        assert_eq!(d1.initial_rank, 0);
        assert_eq!(d1.appearances_count, 1);

        pool.admit(&[doc("doc2", 0.85), doc("doc3", 0.7)], "rewrite_0", 0);
        assert_eq!(pool.len(), 3);
        let d2 = pool.get("doc2").unwrap();
        assert_eq!(d2.sources["original"], 0.8);
        assert_eq!(d2.sources["rewrite_0"], 0.85);
        assert_eq!(d2.initial_rank, 0); // min(1, 0)
        assert_eq!(d2.appearances_count, 2);
        assert_eq!(d2.final_score(), 0.85);
        assert_eq!(d2.state, ItemState::Candidate);
    }

    #[test]
    fn double_admit_same_round_keeps_max_score() {
        let mut pool = CandidatePool::new();
        pool.admit(&[doc("a", 0.3)], "original", 0);
        pool.admit(&[doc("a", 0.5)], "original", 0);
        let item = pool.get("a").unwrap();
        assert_eq!(item.sources["original"], 0.5);
        assert_eq!(item.appearances_count, 2);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn initial_rank_takes_minimum_across_rounds() {
        let mut pool = CandidatePool::new();
        let docs: Vec<ScoredDocument> = (0..5).map(|i| doc(&format!("doc{i}"), 0.5)).collect();
        pool.admit(&docs, "original", 0);
        assert_eq!(pool.get("doc3").unwrap().initial_rank, 3);

        pool.admit(&[doc("doc3", 0.6)], "rewrite_0", 0);
        let item = pool.get("doc3").unwrap();
        assert_eq!(item.initial_rank, 0);
        assert_eq!(item.appearances_count, 2);
    }

    #[test]
    fn cap_eviction_is_deterministic() {
        let mut pool = CandidatePool::default();
        pool.max_size = Some(2);
        let outcome = pool.admit(
            &[doc("doc1", 0.1), doc("doc2", 0.9), doc("doc3", 0.5), doc("doc4", 0.5)],
            "original",
            0,
        );
        // doc2 (0.9) and doc3 (0.5, id tie-break over doc4) survive.
        assert_eq!(pool.len(), 2);
        assert!(pool.get("doc2").is_some());
        assert!(pool.get("doc3").is_some());
        assert_eq!(outcome.evicted, vec!["doc1".to_string(), "doc4".to_string()]);
    }

    #[test]
    fn cap_exempts_non_candidates() {
        let mut pool = pool_with(&[("a", 0.9), ("b", 0.1)]);
        pool.max_size = Some(1);
        pool.transition(&["b".to_string()], ItemState::InFlight).unwrap();
        let outcome = pool.admit(&[doc("c", 0.8)], "rewrite_0", 0);
        // "b" has the worst score but is in flight; "c" beats nothing else
        // evictable, so the candidate "a"... holds the top slot, and only
        // candidates beyond the cap go.
        assert!(pool.get("b").is_some());
        assert!(!outcome.evicted.contains(&"b".to_string()));
    }

    #[test]
    fn legal_transition_path() {
        let mut pool = pool_with(&[("a", 0.9)]);
        pool.transition(&["a".to_string()], ItemState::InFlight).unwrap();
        assert_eq!(pool.get("a").unwrap().state, ItemState::InFlight);
        pool.transition(&["a".to_string()], ItemState::Reranked).unwrap();
        pool.transition(&["a".to_string()], ItemState::Dropped).unwrap();
        assert_eq!(pool.get("a").unwrap().state, ItemState::Dropped);
    }

    #[test]
    fn illegal_transition_is_atomic() {
        let mut pool = pool_with(&[("a", 0.9), ("b", 0.8)]);
        pool.transition(&["b".to_string()], ItemState::InFlight).unwrap();
        pool.transition(&["b".to_string()], ItemState::Reranked).unwrap();

        // "a" (candidate -> in_flight) is legal, "b" (reranked -> in_flight)
        // is not; neither may change.
        let err = pool
            .transition(&["a".to_string(), "b".to_string()], ItemState::InFlight)
            .unwrap_err();
        assert!(matches!(err, PoolError::IllegalTransition { .. }));
        assert_eq!(pool.get("a").unwrap().state, ItemState::Candidate);
        assert_eq!(pool.get("b").unwrap().state, ItemState::Reranked);
    }

    #[test]
    fn dropped_is_terminal() {
        let mut pool = pool_with(&[("a", 0.9)]);
        pool.transition(&["a".to_string()], ItemState::Dropped).unwrap();
        for target in [ItemState::Candidate, ItemState::InFlight, ItemState::Reranked] {
            assert!(pool.transition(&["a".to_string()], target).is_err());
        }
    }

    #[test]
    fn unknown_ids_are_skipped_and_reported() {
        let mut pool = pool_with(&[("a", 0.9)]);
        let outcome = pool
            .transition(&["a".to_string(), "ghost".to_string()], ItemState::InFlight)
            .unwrap();
        assert_eq!(outcome.applied, vec!["a".to_string()]);
        assert_eq!(outcome.unknown, vec!["ghost".to_string()]);
    }

    #[test]
    fn update_scores_requires_in_flight() {
        let mut pool = pool_with(&[("a", 0.9)]);
        let scores = BTreeMap::from([("a".to_string(), 0.5)]);
        let err = pool.update_scores(&scores, "cross_encoder", &[]).unwrap_err();
        assert!(matches!(err, PoolError::IllegalTransition { .. }));
        assert_eq!(pool.get("a").unwrap().state, ItemState::Candidate);
    }

    #[test]
    fn update_scores_drops_missing_expected_ids() {
        let mut pool = pool_with(&[("a", 0.9), ("b", 0.8)]);
        let batch = vec!["a".to_string(), "b".to_string()];
        pool.transition(&batch, ItemState::InFlight).unwrap();

        let scores = BTreeMap::from([("a".to_string(), 0.95)]);
        let outcome = pool.update_scores(&scores, "cross_encoder", &batch).unwrap();
        assert_eq!(outcome.reranked, vec!["a".to_string()]);
        assert_eq!(outcome.dropped, vec!["b".to_string()]);

        let a = pool.get("a").unwrap();
        assert_eq!(a.state, ItemState::Reranked);
        assert_eq!(a.reranker_score, Some(0.95));
        assert_eq!(a.reranker_strategy.as_deref(), Some("cross_encoder"));
        assert_eq!(pool.get("b").unwrap().state, ItemState::Dropped);
    }

    #[test]
    fn empty_update_is_a_no_op() {
        let mut pool = pool_with(&[("a", 0.9)]);
        let outcome = pool.update_scores(&BTreeMap::new(), "cross_encoder", &[]).unwrap();
        assert!(outcome.reranked.is_empty());
        assert!(outcome.dropped.is_empty());
        assert_eq!(pool.get("a").unwrap().state, ItemState::Candidate);
    }

    #[test]
    fn apply_priorities_touches_candidates_only() {
        let mut pool = pool_with(&[("a", 0.9), ("b", 0.8)]);
        pool.transition(&["b".to_string()], ItemState::InFlight).unwrap();
        let priorities = BTreeMap::from([
            ("a".to_string(), 0.4),
            ("b".to_string(), 0.7),
            ("ghost".to_string(), 1.0),
        ]);
        pool.apply_priorities(&priorities);
        assert_eq!(pool.get("a").unwrap().priority_value, 0.4);
        assert_eq!(pool.get("b").unwrap().priority_value, 0.0);
    }

    #[test]
    fn apply_priorities_is_idempotent() {
        let mut pool = pool_with(&[("a", 0.9)]);
        let priorities = BTreeMap::from([("a".to_string(), 0.4)]);
        pool.apply_priorities(&priorities);
        pool.apply_priorities(&priorities);
        assert_eq!(pool.get("a").unwrap().priority_value, 0.4);
    }

    #[test]
    fn final_score_precedence() {
        let mut item = PoolItem::from_document(&doc("a", 0.6), "original", 0);
        assert_eq!(item.final_score(), 0.6);
        item.priority_value = 0.7;
        assert_eq!(item.final_score(), 0.7);
        item.reranker_score = Some(0.1);
        assert_eq!(item.final_score(), 0.1);
    }

    #[test]
    fn active_items_order_and_membership() {
        let mut pool = pool_with(&[("a", 0.9), ("b", 0.8), ("c", 0.7), ("d", 0.6)]);
        let batch = vec!["a".to_string(), "b".to_string()];
        pool.transition(&batch, ItemState::InFlight).unwrap();
        let scores = BTreeMap::from([("a".to_string(), 0.1), ("b".to_string(), 0.95)]);
        pool.update_scores(&scores, "cross_encoder", &batch).unwrap();

        let order: Vec<&str> = pool.get_active_items().iter().map(|i| i.doc_id.as_str()).collect();
        assert_eq!(order, vec!["b", "c", "d", "a"]);
    }

    #[test]
    fn active_items_tie_break_by_initial_rank_then_id() {
        let mut pool = pool_with(&[("b", 0.5), ("a", 0.5)]);
        let order: Vec<&str> = pool.get_active_items().iter().map(|i| i.doc_id.as_str()).collect();
        // Same score: "b" was retrieved first (rank 0).
        assert_eq!(order, vec!["b", "a"]);
    }

    #[test]
    fn every_item_sits_in_exactly_one_bucket() {
        let mut pool = pool_with(&[("a", 0.9), ("b", 0.8), ("c", 0.7)]);
        pool.transition(&["a".to_string()], ItemState::InFlight).unwrap();
        pool.transition(&["b".to_string()], ItemState::Dropped).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(
            stats.candidate + stats.in_flight + stats.reranked + stats.dropped,
            stats.total
        );
    }
}
