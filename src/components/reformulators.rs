//! Query reformulators.

use std::sync::Arc;

use async_trait::async_trait;

use super::similarity::bigram_dice;
use crate::core::error::ComponentError;
use crate::core::traits::Reformulator;
use crate::core::types::RunContext;
use crate::llm::{extract_json_array, ChatClient, ChatPrompt};
use crate::memo::ReformulationMemo;

/// Variants more similar than this to an earlier one are dropped.
const NEAR_DUPLICATE_THRESHOLD: f64 = 0.8;

const MAX_OUTPUT_TOKENS: u32 = 1000;

fn normalize_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Turn a raw completion into a cleaned, ordered variant list.
///
/// Tolerates code fences and conversational padding around the JSON array.
/// Empty strings are dropped, the original query is filtered by exact match
/// after whitespace normalization, and near-duplicates are filtered keeping
/// the first occurrence.
pub(crate) fn parse_variants(
    raw: &str,
    original: &str,
    cap: usize,
) -> Result<Vec<String>, ComponentError> {
    let json = extract_json_array(raw);
    let values: Vec<serde_json::Value> = serde_json::from_str(json)
        .map_err(|e| ComponentError::msg(format!("reformulation parse error: {e}")))?;

    let original = normalize_ws(original);
    let mut kept: Vec<String> = Vec::new();
    for value in values {
        let Some(text) = value.as_str() else { continue };
        let text = normalize_ws(text);
        if text.is_empty() || text == original {
            continue;
        }
        if kept
            .iter()
            .any(|earlier| bigram_dice(earlier, &text) > NEAR_DUPLICATE_THRESHOLD)
        {
            continue;
        }
        kept.push(text);
    }
    kept.truncate(cap);
    Ok(kept)
}

/// LLM-backed reformulator with an optional cross-request memo.
pub struct LlmReformulator {
    client: Arc<dyn ChatClient>,
    model: String,
    pub num_variants: usize,
    memo: Option<Arc<ReformulationMemo>>,
}

impl LlmReformulator {
    pub fn new(client: Arc<dyn ChatClient>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
            num_variants: 2,
            memo: None,
        }
    }

    pub fn with_num_variants(mut self, n: usize) -> Self {
        self.num_variants = n;
        self
    }

    pub fn with_memo(mut self, memo: Arc<ReformulationMemo>) -> Self {
        self.memo = Some(memo);
        self
    }

    fn prompt(&self, ctx: &RunContext) -> ChatPrompt {
        let user = format!(
            "Rewrite the search query below into {} diverse alternative phrasings that \
             could surface different relevant documents. Reply with a JSON array of \
             strings only.\n\nQuery: {}",
            self.num_variants, ctx.query
        );
        ChatPrompt::new(self.model.clone(), user).max_output_tokens(MAX_OUTPUT_TOKENS)
    }

    fn postprocess(
        &self,
        raw: &str,
        ctx: &RunContext,
    ) -> Result<Vec<String>, ComponentError> {
        let variants = parse_variants(raw, &ctx.query, self.num_variants)?;
        if let Some(memo) = &self.memo {
            memo.put(&ctx.query, variants.clone());
        }
        Ok(variants)
    }
}

#[async_trait]
impl Reformulator for LlmReformulator {
    fn generate(&self, ctx: &RunContext) -> Result<Vec<String>, ComponentError> {
        if let Some(hit) = self.memo.as_ref().and_then(|memo| memo.get(&ctx.query)) {
            return Ok(hit);
        }
        let output = self.client.complete(&self.prompt(ctx))?;
        self.postprocess(&output.content, ctx)
    }

    async fn generate_async(&self, ctx: &RunContext) -> Result<Vec<String>, ComponentError> {
        if let Some(hit) = self.memo.as_ref().and_then(|memo| memo.get(&ctx.query)) {
            return Ok(hit);
        }
        let output = self.client.complete_async(&self.prompt(ctx)).await?;
        self.postprocess(&output.content, ctx)
    }
}

/// Fixed variant list; handy for configs and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticReformulator {
    pub variants: Vec<String>,
}

impl StaticReformulator {
    pub fn new(variants: Vec<String>) -> Self {
        Self { variants }
    }
}

#[async_trait]
impl Reformulator for StaticReformulator {
    fn generate(&self, _ctx: &RunContext) -> Result<Vec<String>, ComponentError> {
        Ok(self.variants.clone())
    }
}
