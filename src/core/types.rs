//! Request-scoped value types exchanged between components.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::budget::{CostVector, RemainingView};
use super::trace::ControllerTrace;

/// Atomic unit of retrieved content. Immutable outside the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDocument {
    /// Stable document identifier.
    pub id: String,
    /// Text content.
    pub content: String,
    /// Free-form metadata carried from the backend.
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Retrieval score from the backend (or final score on output).
    #[serde(default)]
    pub score: f64,
}

impl ScoredDocument {
    pub fn new(id: impl Into<String>, content: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: BTreeMap::new(),
            score,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Execution context handed to every component.
///
/// Copy-on-modify: reformulated queries get a copy with an overridden
/// `query`; the budget field is an immutable snapshot, refreshed by the
/// controller before each component call. The live tracker never leaves the
/// controller.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub query: String,
    pub budget: RemainingView,
    pub metadata: BTreeMap<String, Value>,
}

impl RunContext {
    pub fn new(query: impl Into<String>, budget: RemainingView) -> Self {
        Self {
            query: query.into(),
            budget,
            metadata: BTreeMap::new(),
        }
    }

    /// Copy with an overridden query (used for reformulation variants).
    pub fn with_query(&self, query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            budget: self.budget.clone(),
            metadata: self.metadata.clone(),
        }
    }

    /// Copy with a refreshed budget snapshot.
    pub fn with_budget(&self, budget: RemainingView) -> Self {
        Self {
            query: self.query.clone(),
            budget,
            metadata: self.metadata.clone(),
        }
    }
}

/// The scheduler's command for the next iteration.
#[derive(Debug, Clone, Serialize)]
pub struct BatchProposal {
    /// Doc ids to send through the reranker, in rank order.
    pub doc_ids: Vec<String>,
    /// Opaque strategy tag passed through to the reranker.
    pub strategy: String,
    /// Expected consumption, charged by the controller after a successful
    /// rerank.
    pub expected_cost: CostVector,
    /// Mean priority of the batch, for debugging.
    pub estimated_utility: f64,
}

/// Final artifact returned to the caller.
#[derive(Debug, Serialize)]
pub struct ControllerOutput {
    pub query: String,
    /// Post-assembly document order; `score` reflects the final score at
    /// termination.
    pub documents: Vec<ScoredDocument>,
    pub trace: ControllerTrace,
    pub final_budget_state: BTreeMap<String, f64>,
}
