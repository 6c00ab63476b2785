//! Core decision engine: budget ledger, candidate pool, component
//! interfaces, and the controller that drives them.

pub mod budget;
pub mod controller;
pub mod error;
pub mod pool;
pub mod trace;
pub mod traits;
pub mod types;

pub use budget::{
    CostBudget, CostTracker, CostVector, RemainingView, HARD_STOP_RESOURCES, LATENCY_MS,
    RERANK_CALLS, RERANK_DOCS, REFORMULATIONS, TOKENS,
};
pub use controller::{Controller, ControllerConfig, ExitReason, RunOptions, ORIGINAL_ROUND};
pub use error::{ComponentError, ControllerError, PoolError};
pub use pool::{CandidatePool, ItemState, PoolItem, PoolStats};
pub use trace::{ControllerTrace, JsonlTraceSink, TraceError, TraceEvent, TraceSink};
pub use traits::{Assembler, Estimator, Feedback, Reformulator, Reranker, Retriever, Scheduler};
pub use types::{BatchProposal, ControllerOutput, RunContext, ScoredDocument};
