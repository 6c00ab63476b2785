//! Rerankers: expensive scorers invoked by the controller.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::core::error::ComponentError;
use crate::core::pool::PoolItem;
use crate::core::traits::Reranker;
use crate::core::types::RunContext;
use crate::llm::{extract_json_object, ChatClient, ChatOutput, ChatPrompt};

/// Identity reranker: every item keeps its best retrieval score.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReranker;

#[async_trait]
impl Reranker for NoopReranker {
    fn rerank(
        &self,
        items: &[PoolItem],
        _strategy: &str,
        _ctx: &RunContext,
    ) -> Result<BTreeMap<String, f64>, ComponentError> {
        Ok(items
            .iter()
            .map(|item| (item.doc_id.clone(), item.max_source()))
            .collect())
    }
}

/// Deterministic simulation: high score when the query occurs in the
/// content, low otherwise. Exercises the feedback loop without a model.
#[derive(Debug, Clone, Copy)]
pub struct KeywordReranker {
    pub match_score: f64,
    pub miss_score: f64,
}

impl Default for KeywordReranker {
    fn default() -> Self {
        Self {
            match_score: 0.95,
            miss_score: 0.3,
        }
    }
}

#[async_trait]
impl Reranker for KeywordReranker {
    fn rerank(
        &self,
        items: &[PoolItem],
        _strategy: &str,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, f64>, ComponentError> {
        let needle = ctx.query.to_lowercase();
        Ok(items
            .iter()
            .map(|item| {
                let score = if item.content.to_lowercase().contains(&needle) {
                    self.match_score
                } else {
                    self.miss_score
                };
                (item.doc_id.clone(), score)
            })
            .collect())
    }
}

/// Listwise LLM scorer: one call per batch, JSON object of id -> score out.
pub struct LlmReranker {
    client: Arc<dyn ChatClient>,
    model: String,
    /// Content is truncated to this many characters per document before it
    /// goes into the prompt.
    pub max_chars_per_doc: usize,
    pub max_output_tokens: u32,
}

impl LlmReranker {
    pub fn new(client: Arc<dyn ChatClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            max_chars_per_doc: 2000,
            max_output_tokens: 512,
        }
    }

    fn prompt(&self, items: &[PoolItem], strategy: &str, ctx: &RunContext) -> ChatPrompt {
        let mut listing = String::new();
        for item in items {
            let content: String = item.content.chars().take(self.max_chars_per_doc).collect();
            listing.push_str(&format!("[{}]\n{}\n\n", item.doc_id, content));
        }
        let user = format!(
            "Query: {}\n\nDocuments:\n{}Score each document's relevance to the query \
             in [0, 1]. Reply with a single JSON object mapping document id to score, \
             e.g. {{\"doc_a\": 0.83}}. No other text.",
            ctx.query, listing
        );
        ChatPrompt::new(self.model.clone(), user)
            .system(format!(
                "You are a precise document relevance judge (tier: {strategy})."
            ))
            .max_output_tokens(self.max_output_tokens)
    }

    fn parse(
        &self,
        output: &ChatOutput,
        items: &[PoolItem],
    ) -> Result<BTreeMap<String, f64>, ComponentError> {
        let raw = extract_json_object(&output.content);
        let parsed: BTreeMap<String, serde_json::Value> = serde_json::from_str(raw)
            .map_err(|e| ComponentError::msg(format!("rerank response parse error: {e}")))?;

        let mut scores = BTreeMap::new();
        for (key, value) in parsed {
            if !items.iter().any(|item| item.doc_id == key) {
                warn!(doc_id = %key, "reranker returned a score for an unknown id; ignoring");
                continue;
            }
            if let Some(score) = value.as_f64() {
                scores.insert(key, score);
            }
        }
        Ok(scores)
    }
}

#[async_trait]
impl Reranker for LlmReranker {
    fn rerank(
        &self,
        items: &[PoolItem],
        strategy: &str,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, f64>, ComponentError> {
        let output = self.client.complete(&self.prompt(items, strategy, ctx))?;
        self.parse(&output, items)
    }

    async fn rerank_async(
        &self,
        items: &[PoolItem],
        strategy: &str,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, f64>, ComponentError> {
        let output = self
            .client
            .complete_async(&self.prompt(items, strategy, ctx))
            .await?;
        self.parse(&output, items)
    }
}
