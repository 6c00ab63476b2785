//! Error types for the core engine.
//!
//! Only two kinds escape a run: an illegal pool transition (a programming
//! error) and a failure of the original-query retrieval. Everything else
//! degrades to a partial but well-formed output.

use thiserror::Error;

use super::pool::ItemState;
use super::trace::ControllerTrace;
use crate::llm::LlmError;

/// Pool state-machine violations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("illegal transition for {doc_id}: {} -> {}", .from.as_str(), .to.as_str())]
    IllegalTransition {
        doc_id: String,
        from: ItemState,
        to: ItemState,
    },
}

/// Failure escaping a pluggable component (retriever, reformulator,
/// reranker). Recoverable unless it comes from the original retrieval.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),
    #[error("{0}")]
    Message(String),
}

impl ComponentError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}

/// Fatal outcomes of a run. Both variants carry the trace recorded up to
/// the failure point, so even a failed run explains what happened.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The original-query retrieval failed; the request cannot proceed.
    #[error("original retrieval failed: {source}")]
    FatalRetrieval {
        source: ComponentError,
        trace: Box<ControllerTrace>,
    },

    /// A pool operation violated the state machine mid-run, e.g. a
    /// reranker echoed a doc id that was admitted but is not part of the
    /// in-flight batch.
    #[error("{source}")]
    Pool {
        source: PoolError,
        trace: Box<ControllerTrace>,
    },
}
