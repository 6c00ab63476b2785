//! Multi-resource budget ledger for a single request.
//!
//! The tracker arbitrates heterogeneous resources (token counts, rerank
//! document counts, call counts, wall-clock latency, arbitrary user-defined
//! keys) under non-raising semantics: running out of budget is an expected
//! outcome, reported through return values and trace events, never through
//! panics or errors.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::trace::ControllerTrace;

pub const TOKENS: &str = "tokens";
pub const RERANK_DOCS: &str = "rerank_docs";
pub const RERANK_CALLS: &str = "rerank_calls";
pub const REFORMULATIONS: &str = "reformulations";
pub const LATENCY_MS: &str = "latency_ms";

/// Resources whose exhaustion terminates the loop. User-defined keys are
/// accounted but advisory.
pub const HARD_STOP_RESOURCES: [&str; 4] = [TOKENS, RERANK_DOCS, RERANK_CALLS, LATENCY_MS];

/// Per-resource limits. Unset resources are unbounded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostBudget {
    #[serde(default)]
    pub limits: BTreeMap<String, f64>,
}

impl CostBudget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, resource: impl Into<String>, limit: f64) -> Self {
        self.limits.insert(resource.into(), limit);
        self
    }

    pub fn limit(&self, resource: &str) -> Option<f64> {
        self.limits.get(resource).copied()
    }
}

/// Open, string-keyed cost declaration (a scheduler's expected cost, a
/// declared retrieval cost, an assembly charge).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostVector(pub BTreeMap<String, f64>);

impl CostVector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resource: impl Into<String>, amount: f64) -> Self {
        self.0.insert(resource.into(), amount);
        self
    }

    pub fn get(&self, resource: &str) -> f64 {
        self.0.get(resource).copied().unwrap_or(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// Immutable snapshot of what is left, handed to pure components.
///
/// Only bounded resources appear; `remaining()` returns `None` for
/// unbounded ones.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemainingView {
    remaining: BTreeMap<String, f64>,
}

impl RemainingView {
    pub fn remaining(&self, resource: &str) -> Option<f64> {
        self.remaining.get(resource).copied()
    }

    /// True when the resource is unbounded or has headroom.
    pub fn has_any(&self, resource: &str) -> bool {
        self.remaining(resource).map_or(true, |r| r > 0.0)
    }

    pub fn is_exhausted(&self) -> bool {
        HARD_STOP_RESOURCES
            .iter()
            .any(|r| self.remaining(r) == Some(0.0))
    }
}

/// Request-scoped ledger. Owned and mutated exclusively by the controller;
/// budget events are recorded through the trace handle the controller
/// passes in.
pub struct CostTracker {
    budget: CostBudget,
    used: BTreeMap<String, f64>,
    started: Instant,
}

impl CostTracker {
    pub fn new(budget: CostBudget) -> Self {
        Self {
            budget,
            used: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    fn used_of(&self, resource: &str) -> f64 {
        if resource == LATENCY_MS {
            self.elapsed_ms()
        } else {
            self.used.get(resource).copied().unwrap_or(0.0)
        }
    }

    /// Refresh the derived latency ledger entry. Monotone: wall-clock time
    /// only moves forward.
    fn touch_latency(&mut self) {
        let elapsed = self.elapsed_ms();
        self.used.insert(LATENCY_MS.to_string(), elapsed);
    }

    /// Charge `amount` of `resource` if it fits the limit.
    ///
    /// Unset limits are unbounded; a denied consume charges nothing. The
    /// latency resource is live: `try_consume(LATENCY_MS, 0)` succeeds iff
    /// the deadline has not elapsed, and every check refreshes the elapsed
    /// charge.
    pub fn try_consume(
        &mut self,
        trace: &mut ControllerTrace,
        resource: &str,
        amount: f64,
    ) -> bool {
        let amount = amount.max(0.0);
        self.touch_latency();

        if resource == LATENCY_MS {
            let ok = match self.budget.limit(LATENCY_MS) {
                Some(limit) => self.elapsed_ms() + amount < limit,
                None => true,
            };
            if !ok {
                trace.add(
                    "budget",
                    "budget_deny",
                    json!({"resource": LATENCY_MS, "elapsed_ms": self.elapsed_ms()}),
                );
            }
            return ok;
        }

        let used = self.used_of(resource);
        match self.budget.limit(resource) {
            Some(limit) if used + amount > limit => {
                trace.add(
                    "budget",
                    "budget_deny",
                    json!({
                        "resource": resource,
                        "requested": amount,
                        "remaining": (limit - used).max(0.0),
                    }),
                );
                false
            }
            _ => {
                *self.used.entry(resource.to_string()).or_insert(0.0) += amount;
                trace.add(
                    "budget",
                    "budget_consume",
                    json!({"resource": resource, "amount": amount}),
                );
                true
            }
        }
    }

    /// All-or-nothing consume of a cost vector: nothing is charged unless
    /// every resource fits.
    pub fn try_consume_all(&mut self, trace: &mut ControllerTrace, cost: &CostVector) -> bool {
        self.touch_latency();
        for (resource, amount) in cost.iter() {
            if resource == LATENCY_MS {
                continue;
            }
            if let Some(limit) = self.budget.limit(resource) {
                let used = self.used_of(resource);
                if used + amount.max(0.0) > limit {
                    trace.add(
                        "budget",
                        "budget_deny",
                        json!({
                            "resource": resource,
                            "requested": amount,
                            "remaining": (limit - used).max(0.0),
                        }),
                    );
                    return false;
                }
            }
        }
        for (resource, amount) in cost.iter() {
            if resource == LATENCY_MS || amount <= 0.0 {
                continue;
            }
            *self.used.entry(resource.to_string()).or_insert(0.0) += amount;
        }
        if !cost.is_empty() {
            trace.add("budget", "budget_consume", json!({"cost": cost}));
        }
        true
    }

    /// Unconditional charge for cost already sunk (a completed rerank call).
    ///
    /// Usage may exceed the limit; the ledger does not clamp, and the next
    /// exhaustion check terminates the loop. This is the single tolerated
    /// overage per run.
    pub fn charge(&mut self, trace: &mut ControllerTrace, cost: &CostVector) {
        self.touch_latency();
        for (resource, amount) in cost.iter() {
            if resource == LATENCY_MS || amount <= 0.0 {
                continue;
            }
            *self.used.entry(resource.to_string()).or_insert(0.0) += amount;
        }
        if !cost.is_empty() {
            trace.add(
                "budget",
                "budget_consume",
                json!({"cost": cost, "sunk": true}),
            );
        }
    }

    /// Snapshot of headroom per bounded resource.
    pub fn remaining_view(&self) -> RemainingView {
        let mut remaining = BTreeMap::new();
        for (resource, limit) in &self.budget.limits {
            let left = (limit - self.used_of(resource)).max(0.0);
            remaining.insert(resource.clone(), left);
        }
        RemainingView { remaining }
    }

    /// True iff any hard-stop resource has zero headroom (latency counts as
    /// elapsed wall clock).
    pub fn is_exhausted(&self) -> bool {
        HARD_STOP_RESOURCES.iter().any(|resource| {
            self.budget
                .limit(resource)
                .is_some_and(|limit| self.used_of(resource) >= limit)
        })
    }

    /// Final usage for inclusion in the output.
    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        let mut used = self.used.clone();
        used.insert(LATENCY_MS.to_string(), self.elapsed_ms());
        used
    }
}
