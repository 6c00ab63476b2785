//! Bundled component implementations.
//!
//! Everything here plugs into the controller through the trait seams in
//! `core::traits`; the engine itself has no privileged knowledge of any of
//! these types.

pub mod assemblers;
pub mod estimators;
pub mod feedback;
pub mod reformulators;
pub mod rerankers;
pub mod retrievers;
pub mod schedulers;
pub mod similarity;

pub use assemblers::GreedyAssembler;
pub use estimators::{BaselineEstimator, CompositeEstimator, MergeRule, SimilarityEstimator};
pub use feedback::{BudgetStopFeedback, CompositeFeedback};
pub use reformulators::{LlmReformulator, StaticReformulator};
pub use rerankers::{KeywordReranker, LlmReranker, NoopReranker};
pub use retrievers::InMemoryRetriever;
pub use schedulers::{
    CompositeScheduler, TopKScheduler, STRATEGY_CROSS_ENCODER, STRATEGY_LLM,
};
