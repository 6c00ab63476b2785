//! Async controller entry point: parity with the sync path, cooperative
//! cancellation, and deterministic admission across concurrent variant
//! retrievals.

mod common;

use std::sync::atomic::AtomicBool;

use common::*;
use ragtune::components::{
    BaselineEstimator, GreedyAssembler, NoopReranker, StaticReformulator, TopKScheduler,
};
use ragtune::core::{Controller, ControllerConfig, CostBudget, RunOptions, ScoredDocument};

fn five_docs() -> Vec<ScoredDocument> {
    vec![
        doc("A", 0.9),
        doc("B", 0.8),
        doc("C", 0.7),
        doc("D", 0.6),
        doc("E", 0.5),
    ]
}

fn build(reranker: Box<dyn ragtune::core::Reranker>, budget: CostBudget) -> Controller {
    Controller::new(
        Box::new(StaticRetriever::new(five_docs())),
        Box::new(BaselineEstimator),
        Box::new(TopKScheduler::new(2)),
        reranker,
        Box::new(GreedyAssembler),
    )
    .with_config(ControllerConfig {
        budget,
        ..ControllerConfig::default()
    })
}

#[tokio::test]
async fn async_run_matches_the_sync_run() {
    let budget = CostBudget::unbounded()
        .with_limit("rerank_docs", 2.0)
        .with_limit("rerank_calls", 1.0);

    let mut sync_controller = build(
        Box::new(ScriptedReranker::new().then_scores(&[("A", 0.1), ("B", 0.95)])),
        budget.clone(),
    );
    let sync_output = sync_controller.run("anything").unwrap();

    let mut async_controller = build(
        Box::new(ScriptedReranker::new().then_scores(&[("A", 0.1), ("B", 0.95)])),
        budget,
    );
    let async_output = async_controller.run_async("anything").await.unwrap();

    assert_eq!(sync_output.trace.actions(), async_output.trace.actions());
    let sync_ids: Vec<&str> = sync_output.documents.iter().map(|d| d.id.as_str()).collect();
    let async_ids: Vec<&str> = async_output.documents.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(sync_ids, async_ids);
    assert_eq!(
        sync_output.final_budget_state.get("rerank_docs"),
        async_output.final_budget_state.get("rerank_docs")
    );
}

#[tokio::test]
async fn async_cancellation_before_the_loop_returns_candidates() {
    let mut controller = build(Box::new(FailingReranker), CostBudget::unbounded());
    let cancel = AtomicBool::new(true);
    let output = controller
        .run_with_options_async(
            "anything",
            RunOptions {
                cancel: Some(&cancel),
                ..RunOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(output.trace.contains_action("cancelled"));
    assert_eq!(output.documents.len(), 5);
    assert!(!output.trace.contains_action("rerank_batch"));
}

#[tokio::test]
async fn concurrent_variant_retrievals_admit_in_variant_order() {
    let retriever = QueryMapRetriever::new(vec![
        ("orig query", vec![doc("A", 0.9)]),
        ("variant one", vec![doc("B", 0.5), doc("shared", 0.45)]),
        ("variant two", vec![doc("shared", 0.95), doc("C", 0.4)]),
    ]);
    let mut controller = Controller::new(
        Box::new(retriever),
        Box::new(BaselineEstimator),
        Box::new(TopKScheduler::new(10)),
        Box::new(NoopReranker),
        Box::new(GreedyAssembler),
    )
    .with_config(ControllerConfig {
        num_reformulations: 2,
        ..ControllerConfig::default()
    })
    .with_reformulator(Box::new(StaticReformulator::new(vec![
        "variant one".to_string(),
        "variant two".to_string(),
    ])));

    let output = controller.run_async("orig query").await.unwrap();

    // Admission order is variant order regardless of completion order.
    let rounds: Vec<&str> = output
        .trace
        .events
        .iter()
        .filter(|e| e.action == "retrieve")
        .map(|e| e.details["round"].as_str().unwrap())
        .collect();
    assert_eq!(rounds, vec!["original", "rewrite_0", "rewrite_1"]);

    // "shared" was first seen by rewrite_0 (rank 1) and merged by
    // rewrite_1 with the better score.
    let shared = output
        .documents
        .iter()
        .find(|d| d.id == "shared")
        .expect("shared doc in output");
    assert_eq!(shared.score, 0.95);
    assert_eq!(output.documents[0].id, "shared");
}

#[tokio::test]
async fn async_reformulation_failure_is_recoverable() {
    let mut controller = Controller::new(
        Box::new(StaticRetriever::new(five_docs())),
        Box::new(BaselineEstimator),
        Box::new(TopKScheduler::new(2)),
        Box::new(NoopReranker),
        Box::new(GreedyAssembler),
    )
    .with_config(ControllerConfig {
        num_reformulations: 1,
        ..ControllerConfig::default()
    })
    .with_reformulator(Box::new(FailingReformulator));

    let output = controller.run_async("anything").await.unwrap();
    assert!(output.trace.contains_action("reformulate_failed"));
    assert_eq!(output.documents.len(), 5);
}
