//! Process-global component registry.
//!
//! Maps `(category, type string)` to a constructor taking a parameter map.
//! The config loader resolves type strings here; the controller itself only
//! ever sees constructed components. Builtins are registered once on first
//! access; embedding applications may register their own types at startup.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::components::{
    BaselineEstimator, BudgetStopFeedback, GreedyAssembler, InMemoryRetriever, KeywordReranker,
    NoopReranker, SimilarityEstimator, StaticReformulator, TopKScheduler,
};
use crate::config::ConfigError;
use crate::core::traits::{
    Assembler, Estimator, Feedback, Reformulator, Reranker, Retriever, Scheduler,
};
use crate::core::types::ScoredDocument;

pub type Params = Map<String, Value>;

type Ctor<T> = Box<dyn Fn(&Params) -> Result<T, ConfigError> + Send + Sync>;

/// Deserialize a parameter map into a typed params struct, rejecting
/// unknown keys.
pub fn parse_params<T: DeserializeOwned>(component: &str, params: &Params) -> Result<T, ConfigError> {
    serde_json::from_value(Value::Object(params.clone())).map_err(|e| ConfigError::Params {
        component: component.to_string(),
        message: e.to_string(),
    })
}

#[derive(Default)]
pub struct ComponentRegistry {
    retrievers: HashMap<String, Ctor<Box<dyn Retriever>>>,
    rerankers: HashMap<String, Ctor<Box<dyn Reranker>>>,
    reformulators: HashMap<String, Ctor<Box<dyn Reformulator>>>,
    estimators: HashMap<String, Ctor<Box<dyn Estimator>>>,
    schedulers: HashMap<String, Ctor<Box<dyn Scheduler>>>,
    assemblers: HashMap<String, Ctor<Box<dyn Assembler>>>,
    feedback: HashMap<String, Ctor<Box<dyn Feedback>>>,
}

macro_rules! registry_category {
    ($register:ident, $build:ident, $field:ident, $trait_obj:ty, $category:literal) => {
        pub fn $register(
            &mut self,
            type_name: impl Into<String>,
            ctor: impl Fn(&Params) -> Result<$trait_obj, ConfigError> + Send + Sync + 'static,
        ) {
            self.$field.insert(type_name.into(), Box::new(ctor));
        }

        pub fn $build(&self, type_name: &str, params: &Params) -> Result<$trait_obj, ConfigError> {
            match self.$field.get(type_name) {
                Some(ctor) => ctor(params),
                None => Err(ConfigError::UnknownType {
                    category: $category,
                    type_name: type_name.to_string(),
                }),
            }
        }
    };
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    registry_category!(register_retriever, build_retriever, retrievers, Box<dyn Retriever>, "retriever");
    registry_category!(register_reranker, build_reranker, rerankers, Box<dyn Reranker>, "reranker");
    registry_category!(register_reformulator, build_reformulator, reformulators, Box<dyn Reformulator>, "reformulator");
    registry_category!(register_estimator, build_estimator, estimators, Box<dyn Estimator>, "estimator");
    registry_category!(register_scheduler, build_scheduler, schedulers, Box<dyn Scheduler>, "scheduler");
    registry_category!(register_assembler, build_assembler, assemblers, Box<dyn Assembler>, "assembler");
    registry_category!(register_feedback, build_feedback, feedback, Box<dyn Feedback>, "feedback");

    /// Registered type names per category, sorted for stable output.
    pub fn list(&self) -> BTreeMap<&'static str, Vec<String>> {
        fn names<T>(map: &HashMap<String, T>) -> Vec<String> {
            let mut names: Vec<String> = map.keys().cloned().collect();
            names.sort();
            names
        }
        BTreeMap::from([
            ("retriever", names(&self.retrievers)),
            ("reranker", names(&self.rerankers)),
            ("reformulator", names(&self.reformulators)),
            ("estimator", names(&self.estimators)),
            ("scheduler", names(&self.schedulers)),
            ("assembler", names(&self.assemblers)),
            ("feedback", names(&self.feedback)),
        ])
    }
}

// Builtin parameter schemas. Unknown keys are load-time errors.

#[derive(serde::Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
struct MemoryRetrieverParams {
    documents: Option<Vec<ScoredDocument>>,
    path: Option<String>,
}

#[derive(serde::Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
struct EmptyParams {}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
struct KeywordRerankerParams {
    match_score: f64,
    miss_score: f64,
}

impl Default for KeywordRerankerParams {
    fn default() -> Self {
        let defaults = KeywordReranker::default();
        Self {
            match_score: defaults.match_score,
            miss_score: defaults.miss_score,
        }
    }
}

#[derive(serde::Deserialize, Default)]
#[serde(deny_unknown_fields, default)]
struct StaticReformulatorParams {
    variants: Vec<String>,
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
struct SimilarityEstimatorParams {
    winner_threshold: f64,
    boost_weight: f64,
}

impl Default for SimilarityEstimatorParams {
    fn default() -> Self {
        let defaults = SimilarityEstimator::default();
        Self {
            winner_threshold: defaults.winner_threshold,
            boost_weight: defaults.boost_weight,
        }
    }
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
struct TopKSchedulerParams {
    batch_size: usize,
    strategy: String,
    escalation_strategy: Option<String>,
    escalate_min_eligible: Option<usize>,
    escalate_confidence: Option<f64>,
    confidence_top_k: usize,
}

impl Default for TopKSchedulerParams {
    fn default() -> Self {
        let defaults = TopKScheduler::default();
        Self {
            batch_size: defaults.batch_size,
            strategy: defaults.strategy,
            escalation_strategy: defaults.escalation_strategy,
            escalate_min_eligible: defaults.escalate_min_eligible,
            escalate_confidence: defaults.escalate_confidence,
            confidence_top_k: defaults.confidence_top_k,
        }
    }
}

#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields, default)]
struct BudgetStopParams {
    min_remaining_tokens: f64,
}

impl Default for BudgetStopParams {
    fn default() -> Self {
        Self {
            min_remaining_tokens: BudgetStopFeedback::default().min_remaining_tokens,
        }
    }
}

fn builtins() -> ComponentRegistry {
    let mut registry = ComponentRegistry::new();

    registry.register_retriever("memory", |params| {
        let params: MemoryRetrieverParams = parse_params("retriever/memory", params)?;
        match (params.documents, params.path) {
            (Some(docs), None) => Ok(Box::new(InMemoryRetriever::new(docs)) as Box<dyn Retriever>),
            (None, Some(path)) => Ok(Box::new(
                InMemoryRetriever::from_jsonl(&path)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))?,
            )),
            _ => Err(ConfigError::Invalid(
                "retriever/memory requires exactly one of `documents` or `path`".to_string(),
            )),
        }
    });

    registry.register_reranker("noop", |params| {
        let _: EmptyParams = parse_params("reranker/noop", params)?;
        Ok(Box::new(NoopReranker) as Box<dyn Reranker>)
    });
    registry.register_reranker("keyword", |params| {
        let params: KeywordRerankerParams = parse_params("reranker/keyword", params)?;
        Ok(Box::new(KeywordReranker {
            match_score: params.match_score,
            miss_score: params.miss_score,
        }) as Box<dyn Reranker>)
    });

    registry.register_reformulator("static", |params| {
        let params: StaticReformulatorParams = parse_params("reformulator/static", params)?;
        Ok(Box::new(StaticReformulator::new(params.variants)) as Box<dyn Reformulator>)
    });

    registry.register_estimator("baseline", |params| {
        let _: EmptyParams = parse_params("estimator/baseline", params)?;
        Ok(Box::new(BaselineEstimator) as Box<dyn Estimator>)
    });
    registry.register_estimator("similarity", |params| {
        let params: SimilarityEstimatorParams = parse_params("estimator/similarity", params)?;
        Ok(Box::new(SimilarityEstimator {
            winner_threshold: params.winner_threshold,
            boost_weight: params.boost_weight,
        }) as Box<dyn Estimator>)
    });

    registry.register_scheduler("topk", |params| {
        let params: TopKSchedulerParams = parse_params("scheduler/topk", params)?;
        let mut scheduler = TopKScheduler::new(params.batch_size);
        scheduler.strategy = params.strategy;
        scheduler.escalation_strategy = params.escalation_strategy;
        scheduler.escalate_min_eligible = params.escalate_min_eligible;
        scheduler.escalate_confidence = params.escalate_confidence;
        scheduler.confidence_top_k = params.confidence_top_k;
        Ok(Box::new(scheduler) as Box<dyn Scheduler>)
    });

    registry.register_assembler("greedy", |params| {
        let _: EmptyParams = parse_params("assembler/greedy", params)?;
        Ok(Box::new(GreedyAssembler) as Box<dyn Assembler>)
    });

    registry.register_feedback("budget_stop", |params| {
        let params: BudgetStopParams = parse_params("feedback/budget_stop", params)?;
        Ok(Box::new(BudgetStopFeedback {
            min_remaining_tokens: params.min_remaining_tokens,
        }) as Box<dyn Feedback>)
    });

    registry
}

static GLOBAL: Lazy<RwLock<ComponentRegistry>> = Lazy::new(|| RwLock::new(builtins()));

/// The process-global registry, initialized with the builtins.
pub fn global() -> &'static RwLock<ComponentRegistry> {
    &GLOBAL
}
