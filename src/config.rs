//! Declarative pipeline configuration.
//!
//! A hierarchical JSON document describes the budget, the component graph,
//! and the retrieval depths. Unknown keys are rejected here, at load time;
//! the core engine only ever receives fully constructed, typed components.
//!
//! A component slot holds either a single `{type, params}` record or a
//! list. Lists build composites: estimators merge by the configured rule
//! (an `estimator` list may lead with a `"composite"` record carrying
//! `merge` and `components` params), schedulers poll in declaration order,
//! feedback merges pessimistically.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::components::{CompositeEstimator, CompositeFeedback, CompositeScheduler, MergeRule};
use crate::core::budget::{CostBudget, CostVector};
use crate::core::controller::{Controller, ControllerConfig};
use crate::core::traits::{Estimator, Feedback, Scheduler};
use crate::registry::{self, parse_params, Params};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("unknown {category} type: {type_name}")]
    UnknownType {
        category: &'static str,
        type_name: String,
    },
    #[error("invalid params for {component}: {message}")]
    Params { component: String, message: String },
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Label for logs and rendered output.
    pub name: String,
    #[serde(default)]
    pub budget: BudgetSection,
    pub components: ComponentsSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
    #[serde(default)]
    pub pool: PoolSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetSection {
    /// Resource name -> limit. Absent resources are unbounded.
    #[serde(default)]
    pub limits: BTreeMap<String, f64>,
    /// Declared cost of one reformulation-variant retrieval.
    #[serde(default)]
    pub variant_retrieval_cost: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentsSection {
    pub retriever: ComponentEntry,
    pub reranker: ComponentEntry,
    #[serde(default)]
    pub reformulator: Option<ComponentEntry>,
    pub estimator: ComponentEntry,
    pub scheduler: ComponentEntry,
    pub assembler: ComponentEntry,
    #[serde(default)]
    pub feedback: Option<ComponentEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ComponentEntry {
    One(ComponentSpec),
    Many(Vec<ComponentSpec>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentSpec {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub params: Params,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetrievalSection {
    pub original_query_depth: usize,
    pub num_reformulations: usize,
    pub depth_per_reformulation: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            original_query_depth: 10,
            num_reformulations: 0,
            depth_per_reformulation: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PoolSection {
    pub max_size: Option<usize>,
}

/// Load and validate a config file (JSON).
pub fn load_config(path: impl AsRef<Path>) -> Result<ConfigFile, ConfigError> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    parse_config(&raw)
}

pub fn parse_config(raw: &str) -> Result<ConfigFile, ConfigError> {
    let file: ConfigFile =
        serde_json::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate(&file.pipeline)?;
    Ok(file)
}

fn validate(config: &PipelineConfig) -> Result<(), ConfigError> {
    for (resource, limit) in &config.budget.limits {
        if *limit < 0.0 || !limit.is_finite() {
            return Err(ConfigError::Invalid(format!(
                "budget limit for {resource} must be a finite nonnegative number"
            )));
        }
    }
    if config.retrieval.original_query_depth == 0 {
        return Err(ConfigError::Invalid(
            "retrieval.original_query_depth must be >= 1".to_string(),
        ));
    }
    if config.retrieval.num_reformulations > 0 && config.components.reformulator.is_none() {
        return Err(ConfigError::Invalid(
            "retrieval.num_reformulations > 0 requires components.reformulator".to_string(),
        ));
    }
    Ok(())
}

/// Composite estimator record: `{type: "composite", params: {merge, components}}`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CompositeEstimatorParams {
    #[serde(default = "default_merge")]
    merge: String,
    components: Vec<ComponentSpec>,
}

fn default_merge() -> String {
    "mean".to_string()
}

fn build_estimator_spec(spec: &ComponentSpec) -> Result<Box<dyn Estimator>, ConfigError> {
    if spec.type_name == "composite" {
        let params: CompositeEstimatorParams =
            parse_params("estimator/composite", &spec.params)?;
        let merge = MergeRule::parse(&params.merge).ok_or_else(|| ConfigError::Invalid(
            format!("unknown merge rule: {}", params.merge),
        ))?;
        let parts = params
            .components
            .iter()
            .map(build_estimator_spec)
            .collect::<Result<Vec<_>, _>>()?;
        return Ok(Box::new(CompositeEstimator::new(parts, merge)));
    }
    let registry = registry::global().read().expect("registry lock");
    registry.build_estimator(&spec.type_name, &spec.params)
}

fn build_estimator_entry(entry: &ComponentEntry) -> Result<Box<dyn Estimator>, ConfigError> {
    match entry {
        ComponentEntry::One(spec) => build_estimator_spec(spec),
        ComponentEntry::Many(specs) => {
            let parts = specs
                .iter()
                .map(build_estimator_spec)
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(CompositeEstimator::new(parts, MergeRule::Mean)))
        }
    }
}

fn build_scheduler_entry(entry: &ComponentEntry) -> Result<Box<dyn Scheduler>, ConfigError> {
    let build = |spec: &ComponentSpec| {
        let registry = registry::global().read().expect("registry lock");
        registry.build_scheduler(&spec.type_name, &spec.params)
    };
    match entry {
        ComponentEntry::One(spec) => build(spec),
        ComponentEntry::Many(specs) => {
            let parts = specs.iter().map(build).collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(CompositeScheduler::new(parts)))
        }
    }
}

fn build_feedback_entry(entry: &ComponentEntry) -> Result<Box<dyn Feedback>, ConfigError> {
    let build = |spec: &ComponentSpec| {
        let registry = registry::global().read().expect("registry lock");
        registry.build_feedback(&spec.type_name, &spec.params)
    };
    match entry {
        ComponentEntry::One(spec) => build(spec),
        ComponentEntry::Many(specs) => {
            let parts = specs.iter().map(build).collect::<Result<Vec<_>, _>>()?;
            Ok(Box::new(CompositeFeedback::new(parts)))
        }
    }
}

fn single_spec<'a>(
    entry: &'a ComponentEntry,
    category: &'static str,
) -> Result<&'a ComponentSpec, ConfigError> {
    match entry {
        ComponentEntry::One(spec) => Ok(spec),
        ComponentEntry::Many(_) => Err(ConfigError::Invalid(format!(
            "component lists are supported for estimator, scheduler, and feedback; \
             {category} takes a single record"
        ))),
    }
}

/// Resolve the component graph and assemble a controller.
pub fn build_controller(config: &PipelineConfig) -> Result<Controller, ConfigError> {
    let components = &config.components;

    let (retriever, reranker, assembler) = {
        let registry = registry::global().read().expect("registry lock");
        let spec = single_spec(&components.retriever, "retriever")?;
        let retriever = registry.build_retriever(&spec.type_name, &spec.params)?;
        let spec = single_spec(&components.reranker, "reranker")?;
        let reranker = registry.build_reranker(&spec.type_name, &spec.params)?;
        let spec = single_spec(&components.assembler, "assembler")?;
        let assembler = registry.build_assembler(&spec.type_name, &spec.params)?;
        (retriever, reranker, assembler)
    };
    let estimator = build_estimator_entry(&components.estimator)?;
    let scheduler = build_scheduler_entry(&components.scheduler)?;

    let mut variant_cost = CostVector::new();
    for (resource, amount) in &config.budget.variant_retrieval_cost {
        variant_cost = variant_cost.with(resource.clone(), *amount);
    }

    let controller_config = ControllerConfig {
        budget: CostBudget {
            limits: config.budget.limits.clone(),
        },
        original_query_depth: config.retrieval.original_query_depth,
        num_reformulations: config.retrieval.num_reformulations,
        depth_per_reformulation: config.retrieval.depth_per_reformulation,
        max_pool_size: config.pool.max_size,
        variant_retrieval_cost: variant_cost,
    };

    let mut controller =
        Controller::new(retriever, estimator, scheduler, reranker, assembler)
            .with_config(controller_config);

    if let Some(entry) = &components.reformulator {
        let spec = single_spec(entry, "reformulator")?;
        let registry = registry::global().read().expect("registry lock");
        controller = controller
            .with_reformulator(registry.build_reformulator(&spec.type_name, &spec.params)?);
    }
    if let Some(entry) = &components.feedback {
        controller = controller.with_feedback(build_feedback_entry(entry)?);
    }
    Ok(controller)
}
