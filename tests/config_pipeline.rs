//! Declarative config to running pipeline, end to end.

use ragtune::config::{build_controller, load_config};

fn write_config(dir: &std::path::Path, body: &serde_json::Value) -> std::path::PathBuf {
    let path = dir.join("pipeline.json");
    std::fs::write(&path, serde_json::to_string_pretty(body).unwrap()).unwrap();
    path
}

#[test]
fn configured_pipeline_runs_a_query() {
    let dir = tempfile::tempdir().unwrap();
    let config = serde_json::json!({
        "pipeline": {
            "name": "docs-demo",
            "budget": {"limits": {"rerank_docs": 4, "rerank_calls": 2, "tokens": 2000}},
            "components": {
                "retriever": {"type": "memory", "params": {"documents": [
                    {"id": "d1", "content": "budget aware reranking of retrieval candidates", "score": 0.9},
                    {"id": "d2", "content": "reranking with cross encoders", "score": 0.7},
                    {"id": "d3", "content": "gardening for beginners", "score": 0.6}
                ]}},
                "reranker": {"type": "keyword"},
                "estimator": [{"type": "baseline"}, {"type": "similarity"}],
                "scheduler": {"type": "topk", "params": {"batch_size": 2}},
                "assembler": {"type": "greedy"},
                "feedback": {"type": "budget_stop", "params": {"min_remaining_tokens": 10}}
            },
            "retrieval": {"original_query_depth": 5}
        }
    });
    let path = write_config(dir.path(), &config);

    let file = load_config(&path).unwrap();
    let mut controller = build_controller(&file.pipeline).unwrap();
    let output = controller.run("reranking").unwrap();

    assert!(!output.documents.is_empty());
    // The keyword reranker scores query matches at 0.95.
    assert_eq!(output.documents[0].score, 0.95);
    assert!(output.trace.contains_action("rerank_batch"));
    assert!(output.final_budget_state["rerank_docs"] > 0.0);
}

#[test]
fn unknown_keys_anywhere_fail_the_load() {
    let dir = tempfile::tempdir().unwrap();
    let config = serde_json::json!({
        "pipeline": {
            "name": "bad",
            "components": {
                "retriever": {"type": "memory", "params": {"documents": []}},
                "reranker": {"type": "noop"},
                "estimator": {"type": "baseline"},
                "scheduler": {"type": "topk", "extra": 1},
                "assembler": {"type": "greedy"}
            }
        }
    });
    let path = write_config(dir.path(), &config);
    assert!(load_config(&path).is_err());
}
