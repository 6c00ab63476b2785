//! Component interfaces.
//!
//! One hierarchy serves both controller modes: each I/O-bound trait has a
//! synchronous method and an async variant whose default implementation
//! delegates to it. Synchronous components implement only the sync method
//! and work everywhere; async components override the `_async` variant.
//!
//! Estimators and schedulers are pure readers by contract: they receive the
//! pool and a budget snapshot, return a value, and must not observe
//! anything mutable. Purity is enforced structurally (shared references,
//! snapshot views), not by convention.

use std::collections::BTreeMap;

use async_trait::async_trait;

use super::budget::RemainingView;
use super::error::ComponentError;
use super::pool::{CandidatePool, PoolItem, PoolStats};
use super::types::{BatchProposal, RunContext, ScoredDocument};

/// Adapter boundary to a search backend. Returns an ordered candidate list
/// for the context's query.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn retrieve(&self, ctx: &RunContext, top_k: usize) -> Result<Vec<ScoredDocument>, ComponentError>;

    async fn retrieve_async(
        &self,
        ctx: &RunContext,
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, ComponentError> {
        self.retrieve(ctx, top_k)
    }
}

/// Expensive scorer for a batch of items. Result keys must be a subset of
/// the input ids; a missing id means the item should be dropped (the
/// controller performs that transition).
#[async_trait]
pub trait Reranker: Send + Sync {
    fn rerank(
        &self,
        items: &[PoolItem],
        strategy: &str,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, f64>, ComponentError>;

    async fn rerank_async(
        &self,
        items: &[PoolItem],
        strategy: &str,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, f64>, ComponentError> {
        self.rerank(items, strategy, ctx)
    }
}

/// Produces query variants for supplemental retrieval. The returned
/// sequence excludes the original query.
#[async_trait]
pub trait Reformulator: Send + Sync {
    fn generate(&self, ctx: &RunContext) -> Result<Vec<String>, ComponentError>;

    async fn generate_async(&self, ctx: &RunContext) -> Result<Vec<String>, ComponentError> {
        self.generate(ctx)
    }
}

/// Pure valuation of eligible candidates.
///
/// Deterministic given identical inputs; may return a subset of the
/// eligible ids (absent ids keep their previous priority), and must not
/// value ids outside the eligible set.
pub trait Estimator: Send + Sync + std::fmt::Debug {
    fn value(&self, pool: &CandidatePool, ctx: &RunContext) -> BTreeMap<String, f64>;
}

/// Pure batch-selection policy. Returns `None` when there is nothing worth
/// proposing, which ends the loop.
pub trait Scheduler: Send + Sync + std::fmt::Debug {
    fn select_batch(&self, pool: &CandidatePool, view: &RemainingView) -> Option<BatchProposal>;
}

/// Selects the final token-bounded subsequence.
#[async_trait]
pub trait Assembler: Send + Sync {
    fn assemble(&self, items: Vec<ScoredDocument>, ctx: &RunContext) -> Vec<ScoredDocument>;

    async fn assemble_async(
        &self,
        items: Vec<ScoredDocument>,
        ctx: &RunContext,
    ) -> Vec<ScoredDocument> {
        self.assemble(items, ctx)
    }
}

/// Stop-condition plugin, polled by the controller at the head of every
/// loop iteration. A `true` vote breaks the loop with the given reason.
pub trait Feedback: Send + Sync {
    fn should_stop(
        &mut self,
        stats: &PoolStats,
        view: &RemainingView,
        estimates: &BTreeMap<String, f64>,
    ) -> (bool, String);
}
