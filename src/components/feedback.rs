//! Stop-condition plugins polled at the head of every loop iteration.

use std::collections::BTreeMap;

use crate::core::budget::{RemainingView, TOKENS};
use crate::core::pool::PoolStats;
use crate::core::traits::Feedback;

/// Stops the loop once the remaining token budget dips below a floor,
/// leaving room for assembly.
#[derive(Debug, Clone, Copy)]
pub struct BudgetStopFeedback {
    pub min_remaining_tokens: f64,
}

impl Default for BudgetStopFeedback {
    fn default() -> Self {
        Self {
            min_remaining_tokens: 100.0,
        }
    }
}

impl Feedback for BudgetStopFeedback {
    fn should_stop(
        &mut self,
        _stats: &PoolStats,
        view: &RemainingView,
        _estimates: &BTreeMap<String, f64>,
    ) -> (bool, String) {
        if let Some(remaining) = view.remaining(TOKENS) {
            if remaining < self.min_remaining_tokens {
                return (
                    true,
                    format!(
                        "token budget below floor ({remaining} < {})",
                        self.min_remaining_tokens
                    ),
                );
            }
        }
        (false, String::new())
    }
}

/// Pessimistic merge over stop conditions: the first stop vote wins.
pub struct CompositeFeedback {
    parts: Vec<Box<dyn Feedback>>,
}

impl CompositeFeedback {
    pub fn new(parts: Vec<Box<dyn Feedback>>) -> Self {
        Self { parts }
    }
}

impl Feedback for CompositeFeedback {
    fn should_stop(
        &mut self,
        stats: &PoolStats,
        view: &RemainingView,
        estimates: &BTreeMap<String, f64>,
    ) -> (bool, String) {
        for part in &mut self.parts {
            let (stop, reason) = part.should_stop(stats, view, estimates);
            if stop {
                return (true, reason);
            }
        }
        (false, String::new())
    }
}
