//! Retrieval adapters.

use std::io::BufRead;
use std::path::Path;

use async_trait::async_trait;

use crate::core::error::ComponentError;
use crate::core::traits::Retriever;
use crate::core::types::{RunContext, ScoredDocument};

/// Word-overlap retrieval over an in-process corpus.
///
/// The bundled adapter behind the retriever boundary; real backends
/// (vector stores, BM25 engines) plug in through the same trait.
pub struct InMemoryRetriever {
    documents: Vec<ScoredDocument>,
}

impl InMemoryRetriever {
    pub fn new(documents: Vec<ScoredDocument>) -> Self {
        Self { documents }
    }

    /// Load a corpus of one JSON document per line.
    pub fn from_jsonl(path: impl AsRef<Path>) -> Result<Self, ComponentError> {
        let file = std::fs::File::open(path.as_ref())
            .map_err(|e| ComponentError::msg(format!("corpus open failed: {e}")))?;
        let mut documents = Vec::new();
        for (lineno, line) in std::io::BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| ComponentError::msg(format!("corpus read failed: {e}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let doc: ScoredDocument = serde_json::from_str(&line).map_err(|e| {
                ComponentError::msg(format!("corpus line {} parse failed: {e}", lineno + 1))
            })?;
            documents.push(doc);
        }
        Ok(Self { documents })
    }

    fn query_overlap(query_words: &[String], content: &str) -> f64 {
        if query_words.is_empty() {
            return 0.0;
        }
        let content = content.to_lowercase();
        let hits = query_words
            .iter()
            .filter(|word| content.contains(word.as_str()))
            .count();
        hits as f64 / query_words.len() as f64
    }
}

#[async_trait]
impl Retriever for InMemoryRetriever {
    fn retrieve(
        &self,
        ctx: &RunContext,
        top_k: usize,
    ) -> Result<Vec<ScoredDocument>, ComponentError> {
        let query_words: Vec<String> = ctx
            .query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();

        let mut scored: Vec<(usize, f64)> = self
            .documents
            .iter()
            .enumerate()
            .map(|(index, doc)| (index, Self::query_overlap(&query_words, &doc.content)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let results: Vec<ScoredDocument> = if scored.is_empty() {
            // Nothing matched; fall back to the corpus in its stored order
            // with the stored scores.
            self.documents.iter().take(top_k).cloned().collect()
        } else {
            scored
                .into_iter()
                .take(top_k)
                .map(|(index, score)| {
                    let mut doc = self.documents[index].clone();
                    doc.score = score;
                    doc
                })
                .collect()
        };
        Ok(results)
    }
}
