//! Single-request orchestration.
//!
//! The controller is the sole mutator of budget, pool, and trace state.
//! Components see immutable snapshots and hand decisions back as values;
//! the controller applies them, records what happened, and enforces the
//! failure policy: reformulation and per-batch rerank failures degrade
//! gracefully, only an original-retrieval failure is fatal.
//!
//! Run shape:
//! 1. Original retrieval, admitted under the `"original"` round tag.
//! 2. Optional reformulation fan-out under `"rewrite_{i}"` tags, each
//!    retrieval gated on the declared per-variant cost.
//! 3. Iterative loop: estimate -> schedule -> rerank -> apply, until the
//!    scheduler passes, a budget is exhausted, a feedback plugin votes to
//!    stop, or the caller cancels.
//! 4. Assembly of the active items under the remaining token budget.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::json;
use tracing::warn;

use super::budget::{CostBudget, CostTracker, CostVector, RERANK_CALLS, REFORMULATIONS, TOKENS};
use super::error::{ComponentError, ControllerError, PoolError};
use super::pool::{CandidatePool, ItemState, PoolItem};
use super::trace::{ControllerTrace, TraceSink};
use super::traits::{Assembler, Estimator, Feedback, Reformulator, Reranker, Retriever, Scheduler};
use super::types::{BatchProposal, ControllerOutput, RunContext, ScoredDocument};
use crate::tokens::count_tokens;

/// Round tag for the first retrieval pass.
pub const ORIGINAL_ROUND: &str = "original";

/// Static knobs for a controller, independent of any single request.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Default budget, overridable per run.
    pub budget: CostBudget,
    /// Candidate depth for the original query.
    pub original_query_depth: usize,
    /// Maximum number of query variants to fan out (0 disables
    /// reformulation).
    pub num_reformulations: usize,
    /// Candidate depth per variant retrieval.
    pub depth_per_reformulation: usize,
    /// Optional pool cap applied after each admission round.
    pub max_pool_size: Option<usize>,
    /// Declared cost of one variant retrieval; a deny stops the fan-out.
    pub variant_retrieval_cost: CostVector,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            budget: CostBudget::unbounded(),
            original_query_depth: 10,
            num_reformulations: 0,
            depth_per_reformulation: 5,
            max_pool_size: None,
            variant_retrieval_cost: CostVector::new(),
        }
    }
}

/// Per-run options.
pub struct RunOptions<'a> {
    /// Budget override for this run.
    pub budget: Option<CostBudget>,
    /// Cooperative cancellation flag, checked at every iteration boundary.
    pub cancel: Option<&'a AtomicBool>,
    /// Optional mirror of the trace stream (e.g. a JSONL file).
    pub sink: Option<&'a dyn TraceSink>,
}

impl Default for RunOptions<'_> {
    fn default() -> Self {
        Self {
            budget: None,
            cancel: None,
            sink: None,
        }
    }
}

/// Why the iterative loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    NoProposal,
    BudgetExhausted,
    Cancelled,
    Feedback(String),
}

impl ExitReason {
    fn details(&self) -> serde_json::Value {
        match self {
            ExitReason::NoProposal => json!({"reason": "no_proposal"}),
            ExitReason::BudgetExhausted => json!({"reason": "budget_exhausted"}),
            ExitReason::Cancelled => json!({"reason": "cancelled"}),
            ExitReason::Feedback(detail) => json!({"reason": "feedback", "detail": detail}),
        }
    }
}

enum RoundStep {
    Exit(ExitReason),
    Batch {
        proposal: BatchProposal,
        items: Vec<PoolItem>,
    },
}

/// Orchestrates one query at a time over pluggable components.
pub struct Controller {
    retriever: Box<dyn Retriever>,
    estimator: Box<dyn Estimator>,
    scheduler: Box<dyn Scheduler>,
    reranker: Box<dyn Reranker>,
    assembler: Box<dyn Assembler>,
    reformulator: Option<Box<dyn Reformulator>>,
    feedback: Option<Box<dyn Feedback>>,
    config: ControllerConfig,
}

impl Controller {
    pub fn new(
        retriever: Box<dyn Retriever>,
        estimator: Box<dyn Estimator>,
        scheduler: Box<dyn Scheduler>,
        reranker: Box<dyn Reranker>,
        assembler: Box<dyn Assembler>,
    ) -> Self {
        Self {
            retriever,
            estimator,
            scheduler,
            reranker,
            assembler,
            reformulator: None,
            feedback: None,
            config: ControllerConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reformulator(mut self, reformulator: Box<dyn Reformulator>) -> Self {
        self.reformulator = Some(reformulator);
        self
    }

    pub fn with_feedback(mut self, feedback: Box<dyn Feedback>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Run one request to completion on the calling thread.
    pub fn run(&mut self, query: &str) -> Result<ControllerOutput, ControllerError> {
        self.run_with_options(query, RunOptions::default())
    }

    pub fn run_with_options(
        &mut self,
        query: &str,
        opts: RunOptions<'_>,
    ) -> Result<ControllerOutput, ControllerError> {
        let mut trace = ControllerTrace::new();
        let budget = opts.budget.clone().unwrap_or_else(|| self.config.budget.clone());
        let mut tracker = CostTracker::new(budget);
        let mut pool = self.new_pool();
        let base_ctx = RunContext::new(query, tracker.remaining_view());

        // Original retrieval: the one fatal failure point.
        let ctx = base_ctx.with_budget(tracker.remaining_view());
        let docs = match self.retriever.retrieve(&ctx, self.config.original_query_depth) {
            Ok(docs) => docs,
            Err(source) => {
                return Err(self.fatal_retrieval(trace, source, opts.sink));
            }
        };
        self.admit_round(
            &mut pool,
            &mut trace,
            &docs,
            ORIGINAL_ROUND,
            self.config.original_query_depth,
        );

        // Reformulation fan-out.
        let variants = self.reformulate_sync(&mut tracker, &mut trace, &base_ctx);
        let variant_cost = self.config.variant_retrieval_cost.clone();
        for (index, variant) in variants.iter().enumerate() {
            if !tracker.try_consume_all(&mut trace, &variant_cost) {
                break;
            }
            let tag = format!("rewrite_{index}");
            let vctx = base_ctx
                .with_query(variant)
                .with_budget(tracker.remaining_view());
            match self.retriever.retrieve(&vctx, self.config.depth_per_reformulation) {
                Ok(docs) => {
                    self.admit_round(
                        &mut pool,
                        &mut trace,
                        &docs,
                        &tag,
                        self.config.depth_per_reformulation,
                    );
                }
                Err(err) => {
                    warn!(round = %tag, error = %err, "variant retrieval failed; skipping");
                    trace.add(
                        "retriever",
                        "retrieve_error",
                        json!({"round": tag, "error": err.to_string()}),
                    );
                }
            }
        }

        // Iterative rerank loop.
        let mut last_estimates: BTreeMap<String, f64> = BTreeMap::new();
        let exit = loop {
            let step = match self.round_preamble(
                &mut pool,
                &mut tracker,
                &mut trace,
                &base_ctx,
                &mut last_estimates,
                opts.cancel,
            ) {
                Ok(step) => step,
                Err(source) => return Err(self.pool_failure(trace, source, opts.sink)),
            };
            match step {
                RoundStep::Exit(reason) => break reason,
                RoundStep::Batch { proposal, items } => {
                    let ctx = base_ctx.with_budget(tracker.remaining_view());
                    let applied = match self.reranker.rerank(&items, &proposal.strategy, &ctx) {
                        Ok(scores) => self.apply_rerank_success(
                            &mut pool,
                            &mut tracker,
                            &mut trace,
                            &proposal,
                            &scores,
                        ),
                        Err(err) => self.apply_rerank_failure(
                            &mut pool,
                            &mut tracker,
                            &mut trace,
                            &proposal,
                            &err,
                        ),
                    };
                    if let Err(source) = applied {
                        return Err(self.pool_failure(trace, source, opts.sink));
                    }
                    if tracker.is_exhausted() {
                        break ExitReason::BudgetExhausted;
                    }
                }
            }
        };
        trace.add("controller", "loop_exit", exit.details());

        // Assembly.
        let active = Self::active_documents(&pool);
        let ctx = base_ctx.with_budget(tracker.remaining_view());
        let assembled = self.assembler.assemble(active, &ctx);
        Ok(self.finalize(query, assembled, trace, tracker, opts.sink))
    }

    /// Async counterpart of [`Controller::run`]. Same component interfaces,
    /// same semantics; variant retrievals may overlap but admission stays
    /// serialized in variant order.
    pub async fn run_async(&mut self, query: &str) -> Result<ControllerOutput, ControllerError> {
        self.run_with_options_async(query, RunOptions::default()).await
    }

    pub async fn run_with_options_async(
        &mut self,
        query: &str,
        opts: RunOptions<'_>,
    ) -> Result<ControllerOutput, ControllerError> {
        let mut trace = ControllerTrace::new();
        let budget = opts.budget.clone().unwrap_or_else(|| self.config.budget.clone());
        let mut tracker = CostTracker::new(budget);
        let mut pool = self.new_pool();
        let base_ctx = RunContext::new(query, tracker.remaining_view());

        let ctx = base_ctx.with_budget(tracker.remaining_view());
        let docs = match self
            .retriever
            .retrieve_async(&ctx, self.config.original_query_depth)
            .await
        {
            Ok(docs) => docs,
            Err(source) => {
                return Err(self.fatal_retrieval(trace, source, opts.sink));
            }
        };
        self.admit_round(
            &mut pool,
            &mut trace,
            &docs,
            ORIGINAL_ROUND,
            self.config.original_query_depth,
        );

        // Gate the affordable prefix of variants first (deterministic),
        // then retrieve them concurrently and admit in variant order.
        let variants = self.reformulate_async(&mut tracker, &mut trace, &base_ctx).await;
        let variant_cost = self.config.variant_retrieval_cost.clone();
        let mut funded: Vec<(usize, String)> = Vec::new();
        for (index, variant) in variants.iter().enumerate() {
            if !tracker.try_consume_all(&mut trace, &variant_cost) {
                break;
            }
            funded.push((index, variant.clone()));
        }
        let view = tracker.remaining_view();
        let depth = self.config.depth_per_reformulation;
        let retriever = &self.retriever;
        let retrievals = futures::future::join_all(funded.iter().map(|(_, variant)| {
            let vctx = base_ctx.with_query(variant).with_budget(view.clone());
            async move { retriever.retrieve_async(&vctx, depth).await }
        }))
        .await;
        for ((index, _), result) in funded.iter().zip(retrievals) {
            let tag = format!("rewrite_{index}");
            match result {
                Ok(docs) => {
                    self.admit_round(
                        &mut pool,
                        &mut trace,
                        &docs,
                        &tag,
                        self.config.depth_per_reformulation,
                    );
                }
                Err(err) => {
                    warn!(round = %tag, error = %err, "variant retrieval failed; skipping");
                    trace.add(
                        "retriever",
                        "retrieve_error",
                        json!({"round": tag, "error": err.to_string()}),
                    );
                }
            }
        }

        let mut last_estimates: BTreeMap<String, f64> = BTreeMap::new();
        let exit = loop {
            let step = match self.round_preamble(
                &mut pool,
                &mut tracker,
                &mut trace,
                &base_ctx,
                &mut last_estimates,
                opts.cancel,
            ) {
                Ok(step) => step,
                Err(source) => return Err(self.pool_failure(trace, source, opts.sink)),
            };
            match step {
                RoundStep::Exit(reason) => break reason,
                RoundStep::Batch { proposal, items } => {
                    let ctx = base_ctx.with_budget(tracker.remaining_view());
                    let applied = match self
                        .reranker
                        .rerank_async(&items, &proposal.strategy, &ctx)
                        .await
                    {
                        Ok(scores) => self.apply_rerank_success(
                            &mut pool,
                            &mut tracker,
                            &mut trace,
                            &proposal,
                            &scores,
                        ),
                        Err(err) => self.apply_rerank_failure(
                            &mut pool,
                            &mut tracker,
                            &mut trace,
                            &proposal,
                            &err,
                        ),
                    };
                    if let Err(source) = applied {
                        return Err(self.pool_failure(trace, source, opts.sink));
                    }
                    if tracker.is_exhausted() {
                        break ExitReason::BudgetExhausted;
                    }
                }
            }
        };
        trace.add("controller", "loop_exit", exit.details());

        let active = Self::active_documents(&pool);
        let ctx = base_ctx.with_budget(tracker.remaining_view());
        let assembled = self.assembler.assemble_async(active, &ctx).await;
        Ok(self.finalize(query, assembled, trace, tracker, opts.sink))
    }

    fn new_pool(&self) -> CandidatePool {
        match self.config.max_pool_size {
            Some(cap) => CandidatePool::with_cap(cap),
            None => CandidatePool::new(),
        }
    }

    fn admit_round(
        &self,
        pool: &mut CandidatePool,
        trace: &mut ControllerTrace,
        docs: &[ScoredDocument],
        round_tag: &str,
        requested: usize,
    ) {
        let outcome = pool.admit(docs, round_tag, 0);
        trace.add(
            "retriever",
            "retrieve",
            json!({
                "round": round_tag,
                "requested": requested,
                "returned": docs.len(),
                "admitted": outcome.admitted,
                "merged": outcome.merged,
                "evicted": outcome.evicted,
            }),
        );
    }

    fn fatal_retrieval(
        &self,
        mut trace: ControllerTrace,
        source: ComponentError,
        sink: Option<&dyn TraceSink>,
    ) -> ControllerError {
        warn!(error = %source, "original retrieval failed");
        trace.add(
            "retriever",
            "retrieve_error",
            json!({"round": ORIGINAL_ROUND, "error": source.to_string()}),
        );
        Self::mirror(&trace, sink);
        ControllerError::FatalRetrieval {
            source,
            trace: Box::new(trace),
        }
    }

    /// A pool operation rejected a state transition mid-run. The run
    /// cannot continue, but the trace up to the violation travels with
    /// the error.
    fn pool_failure(
        &self,
        mut trace: ControllerTrace,
        source: PoolError,
        sink: Option<&dyn TraceSink>,
    ) -> ControllerError {
        warn!(error = %source, "pool state violation aborted the run");
        trace.add("pool", "pool_error", json!({"error": source.to_string()}));
        Self::mirror(&trace, sink);
        ControllerError::Pool {
            source,
            trace: Box::new(trace),
        }
    }

    /// Reformulation is enabled by configuration and funded by the
    /// `reformulations` resource; any failure is recoverable and leaves the
    /// run on the original query only.
    fn reformulate_sync(
        &self,
        tracker: &mut CostTracker,
        trace: &mut ControllerTrace,
        base_ctx: &RunContext,
    ) -> Vec<String> {
        let Some(reformulator) = self.reformulator.as_ref() else {
            return Vec::new();
        };
        if self.config.num_reformulations == 0
            || !tracker.try_consume(trace, REFORMULATIONS, 1.0)
        {
            return Vec::new();
        }
        let ctx = base_ctx.with_budget(tracker.remaining_view());
        match reformulator.generate(&ctx) {
            Ok(mut variants) => {
                variants.truncate(self.config.num_reformulations);
                trace.add(
                    "reformulator",
                    "reformulate",
                    json!({"variants": variants, "count": variants.len()}),
                );
                variants
            }
            Err(err) => {
                warn!(error = %err, "reformulation failed; continuing with original query");
                trace.add(
                    "reformulator",
                    "reformulate_failed",
                    json!({"error": err.to_string()}),
                );
                Vec::new()
            }
        }
    }

    async fn reformulate_async(
        &self,
        tracker: &mut CostTracker,
        trace: &mut ControllerTrace,
        base_ctx: &RunContext,
    ) -> Vec<String> {
        let Some(reformulator) = self.reformulator.as_ref() else {
            return Vec::new();
        };
        if self.config.num_reformulations == 0
            || !tracker.try_consume(trace, REFORMULATIONS, 1.0)
        {
            return Vec::new();
        }
        let ctx = base_ctx.with_budget(tracker.remaining_view());
        match reformulator.generate_async(&ctx).await {
            Ok(mut variants) => {
                variants.truncate(self.config.num_reformulations);
                trace.add(
                    "reformulator",
                    "reformulate",
                    json!({"variants": variants, "count": variants.len()}),
                );
                variants
            }
            Err(err) => {
                warn!(error = %err, "reformulation failed; continuing with original query");
                trace.add(
                    "reformulator",
                    "reformulate_failed",
                    json!({"error": err.to_string()}),
                );
                Vec::new()
            }
        }
    }

    /// Everything in one loop iteration up to the rerank call: cancellation
    /// and exhaustion checks, feedback poll, estimation, batch selection,
    /// and the move to in-flight.
    fn round_preamble(
        &mut self,
        pool: &mut CandidatePool,
        tracker: &mut CostTracker,
        trace: &mut ControllerTrace,
        base_ctx: &RunContext,
        last_estimates: &mut BTreeMap<String, f64>,
        cancel: Option<&AtomicBool>,
    ) -> Result<RoundStep, PoolError> {
        if let Some(flag) = cancel {
            if flag.load(Ordering::Relaxed) {
                trace.add("controller", "cancelled", json!({}));
                return Ok(RoundStep::Exit(ExitReason::Cancelled));
            }
        }
        if tracker.is_exhausted() {
            return Ok(RoundStep::Exit(ExitReason::BudgetExhausted));
        }
        if let Some(feedback) = self.feedback.as_mut() {
            let (stop, reason) =
                feedback.should_stop(&pool.stats(), &tracker.remaining_view(), last_estimates);
            if stop {
                return Ok(RoundStep::Exit(ExitReason::Feedback(reason)));
            }
        }

        let ctx = base_ctx.with_budget(tracker.remaining_view());
        let priorities = self.estimator.value(pool, &ctx);
        pool.apply_priorities(&priorities);
        trace.add("estimator", "estimate", json!({"count": priorities.len()}));
        *last_estimates = priorities;

        let view = tracker.remaining_view();
        let Some(proposal) = self.scheduler.select_batch(pool, &view) else {
            trace.add("scheduler", "no_proposal", json!({}));
            return Ok(RoundStep::Exit(ExitReason::NoProposal));
        };
        trace.add(
            "scheduler",
            "propose_batch",
            json!({
                "doc_ids": proposal.doc_ids,
                "strategy": proposal.strategy,
                "expected_cost": proposal.expected_cost,
                "estimated_utility": proposal.estimated_utility,
            }),
        );

        let outcome = pool.transition(&proposal.doc_ids, ItemState::InFlight)?;
        if !outcome.unknown.is_empty() {
            trace.add(
                "pool",
                "unknown_id",
                json!({"op": "transition", "doc_ids": outcome.unknown}),
            );
        }
        let items: Vec<PoolItem> = pool
            .get_items(&proposal.doc_ids)
            .into_iter()
            .cloned()
            .collect();
        Ok(RoundStep::Batch { proposal, items })
    }

    fn apply_rerank_success(
        &self,
        pool: &mut CandidatePool,
        tracker: &mut CostTracker,
        trace: &mut ControllerTrace,
        proposal: &BatchProposal,
        scores: &BTreeMap<String, f64>,
    ) -> Result<(), PoolError> {
        let outcome = pool.update_scores(scores, &proposal.strategy, &proposal.doc_ids)?;
        if !outcome.unknown.is_empty() {
            trace.add(
                "pool",
                "unknown_id",
                json!({"op": "update_scores", "doc_ids": outcome.unknown}),
            );
        }
        trace.add(
            "reranker",
            "rerank_batch",
            json!({
                "strategy": proposal.strategy,
                "doc_ids": proposal.doc_ids,
                "scored": outcome.reranked.len(),
                "dropped": outcome.dropped,
                "estimated_utility": proposal.estimated_utility,
            }),
        );
        // The cost is sunk: charge even if it overruns a limit. The
        // exhaustion check that follows ends the loop on overrun.
        tracker.charge(trace, &proposal.expected_cost);
        Ok(())
    }

    fn apply_rerank_failure(
        &self,
        pool: &mut CandidatePool,
        tracker: &mut CostTracker,
        trace: &mut ControllerTrace,
        proposal: &BatchProposal,
        err: &ComponentError,
    ) -> Result<(), PoolError> {
        warn!(strategy = %proposal.strategy, error = %err, "rerank batch failed; dropping batch");
        pool.transition(&proposal.doc_ids, ItemState::Dropped)?;
        trace.add(
            "reranker",
            "rerank_error",
            json!({
                "strategy": proposal.strategy,
                "doc_ids": proposal.doc_ids,
                "error": err.to_string(),
            }),
        );
        // The call happened even though it produced nothing; the per-doc
        // cost did not.
        let calls = proposal.expected_cost.get(RERANK_CALLS);
        if calls > 0.0 {
            tracker.charge(trace, &CostVector::new().with(RERANK_CALLS, calls));
        }
        Ok(())
    }

    fn active_documents(pool: &CandidatePool) -> Vec<ScoredDocument> {
        pool.get_active_items()
            .into_iter()
            .map(|item| ScoredDocument {
                id: item.doc_id.clone(),
                content: item.content.clone(),
                metadata: item.metadata.clone(),
                score: item.final_score(),
            })
            .collect()
    }

    fn finalize(
        &self,
        query: &str,
        assembled: Vec<ScoredDocument>,
        mut trace: ControllerTrace,
        mut tracker: CostTracker,
        sink: Option<&dyn TraceSink>,
    ) -> ControllerOutput {
        let token_total: usize = assembled.iter().map(|d| count_tokens(&d.content)).sum();
        tracker.charge(
            &mut trace,
            &CostVector::new().with(TOKENS, token_total as f64),
        );
        trace.add(
            "assembler",
            "assembly",
            json!({"selected": assembled.len(), "tokens": token_total}),
        );
        Self::mirror(&trace, sink);
        ControllerOutput {
            query: query.to_string(),
            documents: assembled,
            trace,
            final_budget_state: tracker.snapshot(),
        }
    }

    fn mirror(trace: &ControllerTrace, sink: Option<&dyn TraceSink>) {
        let Some(sink) = sink else { return };
        for event in &trace.events {
            if let Err(err) = sink.record(event.clone()) {
                warn!(error = %err, "trace sink rejected event; stopping mirror");
                break;
            }
        }
    }
}
