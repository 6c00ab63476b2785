#![forbid(unsafe_code)]

//! # ragtune
//!
//! Budget-aware, iterative retrieval-reranking middleware.
//!
//! Given a large pool of cheaply retrieved candidates, ragtune decides which
//! small subsets are worth paying to rerank with expensive scorers
//! (cross-encoders, LLMs) and stops gracefully when any resource budget runs
//! out. One invocation ingests a query and a budget and produces a ranked,
//! token-bounded document list plus a structured trace of every decision.
//!
//! The separation of concerns is the heart of the design: an `Estimator`
//! values candidates, a `Scheduler` picks the next batch, a `Reranker`
//! executes it, and the `Controller` is the sole mutator of pool and budget
//! state. Estimators and schedulers are pure readers over snapshots, so
//! policies stay composable and independently testable.
//!
//! ```no_run
//! use ragtune::components::{
//!     BaselineEstimator, GreedyAssembler, InMemoryRetriever, KeywordReranker, TopKScheduler,
//! };
//! use ragtune::core::{Controller, ControllerConfig, CostBudget, ScoredDocument};
//!
//! let retriever = InMemoryRetriever::new(vec![
//!     ScoredDocument::new("d1", "budget-aware reranking", 0.9),
//!     ScoredDocument::new("d2", "unrelated text", 0.2),
//! ]);
//! let mut controller = Controller::new(
//!     Box::new(retriever),
//!     Box::new(BaselineEstimator),
//!     Box::new(TopKScheduler::new(2)),
//!     Box::new(KeywordReranker::default()),
//!     Box::new(GreedyAssembler),
//! )
//! .with_config(ControllerConfig {
//!     budget: CostBudget::unbounded().with_limit("rerank_docs", 10.0),
//!     ..ControllerConfig::default()
//! });
//!
//! let output = controller.run("budget-aware reranking")?;
//! println!("{} documents, {} trace events", output.documents.len(), output.trace.events.len());
//! # Ok::<(), ragtune::core::ControllerError>(())
//! ```

pub mod components;
pub mod config;
pub mod core;
pub mod llm;
pub mod memo;
pub mod registry;
pub mod tokens;

pub use config::{build_controller, load_config, ConfigError, PipelineConfig};
pub use core::{
    Controller, ControllerConfig, ControllerError, ControllerOutput, ControllerTrace, CostBudget,
    CostTracker, CostVector, RemainingView, RunOptions, ScoredDocument,
};
pub use memo::ReformulationMemo;
