//! Cross-request memo for query reformulations.
//!
//! Reformulating the same query twice in one process is wasted model spend.
//! The memo is shared across requests, bounded, and never participates in
//! any request's budget accounting.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

fn memo_key(query: &str) -> String {
    let normalized = query.split_whitespace().collect::<Vec<_>>().join(" ");
    blake3::hash(normalized.to_lowercase().as_bytes())
        .to_hex()
        .to_string()
}

/// Bounded LRU map from normalized query to its generated variants.
pub struct ReformulationMemo {
    inner: Mutex<LruCache<String, Vec<String>>>,
}

impl ReformulationMemo {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity is at least 1");
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, query: &str) -> Option<Vec<String>> {
        let mut guard = self.inner.lock().expect("memo lock");
        guard.get(&memo_key(query)).cloned()
    }

    pub fn put(&self, query: &str, variants: Vec<String>) {
        let mut guard = self.inner.lock().expect("memo lock");
        guard.put(memo_key(query), variants);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("memo lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_after_put() {
        let memo = ReformulationMemo::new(4);
        memo.put("what is rag?", vec!["how does rag work".into()]);
        assert_eq!(
            memo.get("what is rag?"),
            Some(vec!["how does rag work".to_string()])
        );
    }

    #[test]
    fn key_ignores_whitespace_and_case() {
        let memo = ReformulationMemo::new(4);
        memo.put("What  is RAG?", vec!["v".into()]);
        assert!(memo.get("what is rag?").is_some());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let memo = ReformulationMemo::new(2);
        memo.put("a", vec!["1".into()]);
        memo.put("b", vec!["2".into()]);
        memo.get("a");
        memo.put("c", vec!["3".into()]);
        assert!(memo.get("a").is_some());
        assert!(memo.get("b").is_none());
        assert!(memo.get("c").is_some());
    }
}
