#![allow(dead_code)]

//! Shared fixtures for the integration suites: deterministic retrievers and
//! scripted rerankers/reformulators with controllable failure modes.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use ragtune::core::{
    ComponentError, PoolItem, Reformulator, Reranker, Retriever, RunContext, ScoredDocument,
};

pub fn doc(id: &str, score: f64) -> ScoredDocument {
    ScoredDocument::new(id, format!("content of {id}"), score)
}

/// Returns the same candidate list for every query.
pub struct StaticRetriever {
    docs: Vec<ScoredDocument>,
}

impl StaticRetriever {
    pub fn new(docs: Vec<ScoredDocument>) -> Self {
        Self { docs }
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    fn retrieve(
        &self,
        _ctx: &RunContext,
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, ComponentError> {
        Ok(self.docs.iter().take(top_k).cloned().collect())
    }
}

/// Candidate lists keyed by exact query text; unknown queries fail.
pub struct QueryMapRetriever {
    map: HashMap<String, Vec<ScoredDocument>>,
}

impl QueryMapRetriever {
    pub fn new(entries: Vec<(&str, Vec<ScoredDocument>)>) -> Self {
        Self {
            map: entries
                .into_iter()
                .map(|(q, docs)| (q.to_string(), docs))
                .collect(),
        }
    }
}

#[async_trait]
impl Retriever for QueryMapRetriever {
    fn retrieve(
        &self,
        ctx: &RunContext,
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, ComponentError> {
        match self.map.get(&ctx.query) {
            Some(docs) => Ok(docs.iter().take(top_k).cloned().collect()),
            None => Err(ComponentError::msg(format!(
                "no fixture for query: {}",
                ctx.query
            ))),
        }
    }
}

/// Sleeps before answering; drives latency-deadline tests.
pub struct SlowRetriever {
    docs: Vec<ScoredDocument>,
    delay_ms: u64,
}

impl SlowRetriever {
    pub fn new(docs: Vec<ScoredDocument>, delay_ms: u64) -> Self {
        Self { docs, delay_ms }
    }
}

#[async_trait]
impl Retriever for SlowRetriever {
    fn retrieve(
        &self,
        _ctx: &RunContext,
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, ComponentError> {
        std::thread::sleep(std::time::Duration::from_millis(self.delay_ms));
        Ok(self.docs.iter().take(top_k).cloned().collect())
    }
}

pub struct FailingRetriever;

#[async_trait]
impl Retriever for FailingRetriever {
    fn retrieve(
        &self,
        _ctx: &RunContext,
        _top_k: usize,
    ) -> Result<Vec<ScoredDocument>, ComponentError> {
        Err(ComponentError::msg("backend unavailable"))
    }
}

/// Pops one scripted outcome per call; an exhausted script is an error so
/// unexpected extra calls surface in assertions.
pub struct ScriptedReranker {
    script: Mutex<VecDeque<Result<BTreeMap<String, f64>, String>>>,
}

impl ScriptedReranker {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
        }
    }

    pub fn then_scores(self, scores: &[(&str, f64)]) -> Self {
        let map: BTreeMap<String, f64> = scores
            .iter()
            .map(|(id, score)| (id.to_string(), *score))
            .collect();
        self.script.lock().unwrap().push_back(Ok(map));
        self
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.script.lock().unwrap().push_back(Err(message.to_string()));
        self
    }
}

#[async_trait]
impl Reranker for ScriptedReranker {
    fn rerank(
        &self,
        _items: &[PoolItem],
        _strategy: &str,
        _ctx: &RunContext,
    ) -> Result<BTreeMap<String, f64>, ComponentError> {
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(scores)) => Ok(scores),
            Some(Err(message)) => Err(ComponentError::msg(message)),
            None => Err(ComponentError::msg("reranker script exhausted")),
        }
    }
}

/// Fails every call.
pub struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    fn rerank(
        &self,
        _items: &[PoolItem],
        _strategy: &str,
        _ctx: &RunContext,
    ) -> Result<BTreeMap<String, f64>, ComponentError> {
        Err(ComponentError::msg("scorer crashed"))
    }
}

pub struct FailingReformulator;

#[async_trait]
impl Reformulator for FailingReformulator {
    fn generate(&self, _ctx: &RunContext) -> Result<Vec<String>, ComponentError> {
        Err(ComponentError::msg("model timeout"))
    }
}
