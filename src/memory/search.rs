//! Hybrid retrieval: vector + BM25 lists fused with weighted Reciprocal Rank
//! Fusion, then boosted by recency and access history.
//!
//! Pipeline of [`SearchEngine::search`]:
//!
//! 1. Fetch `top_k * candidate_multiplier` hits from each index and drop the
//!    ones the prefilter blocks.
//! 2. Fuse: each list contributes `weight / (rrf_k + rank)` (1-based rank).
//! 3. Boost: `base * recency_weight * 0.5^(age / half_life)` plus
//!    `base * access_weight * ln(1 + access_count)`.
//! 4. Expand via the neighbour hook, prefilter, merge (max score wins).
//! 5. Rerank via the rerank hook, prefilter again.
//! 6. Drop results under `min_score`, truncate to `top_k`.
//! 7. Mark the survivors as accessed.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::SearchConfig;
use crate::memory::hooks::{CandidateView, SearchHooks};
use crate::memory::store::MemoryStore;
use crate::memory::types::{SearchHit, SearchResult};
use crate::memory::{parse_timestamp, truncate_preview};

/// One search request.
#[derive(Debug, Clone, Copy)]
pub struct SearchQuery<'a> {
    pub query: &'a str,
    /// Embedding of `query` in the store's embedding space.
    pub embedding: &'a [f32],
    pub top_k: usize,
}

pub struct SearchEngine {
    store: Arc<MemoryStore>,
    config: SearchConfig,
    hooks: SearchHooks,
}

impl SearchEngine {
    pub fn new(store: Arc<MemoryStore>, config: SearchConfig) -> Self {
        Self {
            store,
            config,
            hooks: SearchHooks::default(),
        }
    }

    pub fn with_hooks(mut self, hooks: SearchHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub async fn search(&self, query: &SearchQuery<'_>) -> Result<Vec<SearchResult>> {
        self.search_at(query, Utc::now()).await
    }

    /// [`search`](Self::search) with an explicit clock for recency scoring.
    pub async fn search_at(&self, query: &SearchQuery<'_>, now: DateTime<Utc>) -> Result<Vec<SearchResult>> {
        if query.top_k == 0 {
            return Ok(Vec::new());
        }
        let limit = query
            .top_k
            .max(query.top_k.saturating_mul(self.config.candidate_multiplier));

        let vector_hits = self
            .store
            .vector_search(query.embedding, limit)
            .context("vector search failed")?;
        let text_hits = self
            .store
            .text_search(query.query, limit)
            .context("text search failed")?;

        let vector_hits: Vec<SearchHit> = vector_hits.into_iter().filter(|h| self.allows_hit(h)).collect();
        let text_hits: Vec<SearchHit> = text_hits.into_iter().filter(|h| self.allows_hit(h)).collect();
        debug!(
            vector = vector_hits.len(),
            text = text_hits.len(),
            "retrieved candidates"
        );

        let fused = rrf_merge(
            &vector_hits,
            &text_hits,
            self.config.vector_weight,
            self.config.text_weight,
            self.config.rrf_k,
        );

        let mut results: Vec<SearchResult> = fused
            .into_iter()
            .map(|(hit, base)| self.score(hit, base, now))
            .collect();
        sort_results(&mut results);

        let expanded = self
            .hooks
            .expander
            .expand(&self.store, &results)
            .await
            .context("neighbour expansion failed")?;
        if !expanded.is_empty() {
            merge_expanded(&mut results, self.allowed(expanded));
            sort_results(&mut results);
        }

        let reranked = self
            .hooks
            .reranker
            .rerank(query.query, results)
            .await
            .context("rerank failed")?;
        let mut results = self.allowed(reranked);

        results.retain(|r| r.score >= self.config.min_score);
        results.truncate(query.top_k);
        for result in &mut results {
            if result.snippet.is_empty() {
                result.snippet = truncate_preview(&result.content, self.config.snippet_chars);
            }
        }

        let ids: Vec<i64> = results.iter().map(|r| r.chunk_idx).collect();
        self.store.mark_access(&ids).context("failed to record access")?;

        debug!(returned = results.len(), "search complete");
        Ok(results)
    }

    fn allows_hit(&self, hit: &SearchHit) -> bool {
        self.hooks.prefilter.allow(&CandidateView {
            chunk_idx: hit.id,
            path: &hit.path,
            start_line: hit.start_line,
            end_line: hit.end_line,
            content: &hit.content,
        })
    }

    fn allowed(&self, results: Vec<SearchResult>) -> Vec<SearchResult> {
        results
            .into_iter()
            .filter(|r| self.hooks.prefilter.allow(&CandidateView::of(r)))
            .collect()
    }

    fn score(&self, hit: SearchHit, base: f64, now: DateTime<Utc>) -> SearchResult {
        let recency = hit
            .file_updated_at
            .as_deref()
            .and_then(parse_timestamp)
            .map(|updated| {
                let age_days = (now - updated).num_milliseconds().max(0) as f64 / 86_400_000.0;
                base * self.config.recency_weight * recency_decay(age_days, self.config.recency_half_life_days)
            })
            .unwrap_or(0.0);
        let access = base * self.config.access_weight * (hit.access_count as f64).ln_1p();

        SearchResult {
            chunk_idx: hit.id,
            chunk_id: hit.chunk_key,
            path: hit.path,
            start_line: hit.start_line,
            end_line: hit.end_line,
            content: hit.content,
            score: base + recency + access,
            base_score: base,
            recency_boost: recency,
            access_boost: access,
            snippet: String::new(),
        }
    }
}

/// `0.5^(age / half_life)`. A non-positive half-life disables decay.
pub fn recency_decay(age_days: f64, half_life_days: f64) -> f64 {
    if half_life_days <= 0.0 {
        return 1.0;
    }
    (-age_days * std::f64::consts::LN_2 / half_life_days).exp()
}

/// Weighted Reciprocal Rank Fusion.
///
/// Each list contributes `weight / (k + rank)` with 1-based ranks; a hit
/// missing from a list gets nothing from it. Output keeps first-seen order,
/// vector list first.
pub fn rrf_merge(
    vector_hits: &[SearchHit],
    text_hits: &[SearchHit],
    vector_weight: f64,
    text_weight: f64,
    k: f64,
) -> Vec<(SearchHit, f64)> {
    let mut order: Vec<i64> = Vec::new();
    let mut fused: HashMap<i64, (SearchHit, f64)> = HashMap::new();

    for (hits, weight) in [(vector_hits, vector_weight), (text_hits, text_weight)] {
        for (rank, hit) in hits.iter().enumerate() {
            let contribution = weight / (k + (rank + 1) as f64);
            fused
                .entry(hit.id)
                .and_modify(|(_, score)| *score += contribution)
                .or_insert_with(|| {
                    order.push(hit.id);
                    (hit.clone(), contribution)
                });
        }
    }

    order
        .into_iter()
        .filter_map(|id| fused.remove(&id))
        .collect()
}

fn merge_expanded(results: &mut Vec<SearchResult>, extra: Vec<SearchResult>) {
    let mut index: HashMap<i64, usize> = results
        .iter()
        .enumerate()
        .map(|(i, r)| (r.chunk_idx, i))
        .collect();

    for candidate in extra {
        match index.get(&candidate.chunk_idx) {
            Some(&i) => {
                if candidate.score > results[i].score {
                    results[i] = candidate;
                }
            }
            None => {
                index.insert(candidate.chunk_idx, results.len());
                results.push(candidate);
            }
        }
    }
}

/// Score descending, then row id ascending.
fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.chunk_idx.cmp(&b.chunk_idx))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: i64) -> SearchHit {
        SearchHit {
            id,
            chunk_key: format!("k{id}"),
            path: "a.md".into(),
            start_line: 1,
            end_line: 1,
            content: format!("content {id}"),
            raw_score: 0.0,
            file_updated_at: None,
            access_count: 0,
            last_accessed_at: None,
        }
    }

    fn result(id: i64, score: f64) -> SearchResult {
        SearchResult {
            chunk_idx: id,
            chunk_id: format!("k{id}"),
            path: "a.md".into(),
            start_line: 1,
            end_line: 1,
            content: String::new(),
            score,
            base_score: score,
            recency_boost: 0.0,
            access_boost: 0.0,
            snippet: String::new(),
        }
    }

    #[test]
    fn test_rrf_merge_combines_signals() {
        let vector = vec![hit(1), hit(2)];
        let text = vec![hit(2), hit(3)];
        let fused = rrf_merge(&vector, &text, 0.7, 0.3, 60.0);

        let scores: HashMap<i64, f64> = fused.iter().map(|(h, s)| (h.id, *s)).collect();
        assert!((scores[&1] - 0.7 / 61.0).abs() < 1e-12);
        assert!((scores[&2] - (0.7 / 62.0 + 0.3 / 61.0)).abs() < 1e-12);
        assert!((scores[&3] - 0.3 / 62.0).abs() < 1e-12);
        // present in both lists beats top of one list
        assert!(scores[&2] > scores[&1]);
    }

    #[test]
    fn test_rrf_merge_disjoint_lists() {
        let fused = rrf_merge(&[hit(1)], &[hit(2)], 0.7, 0.3, 60.0);
        assert_eq!(fused.len(), 2);
        assert_eq!(fused[0].0.id, 1);
        assert!(fused[0].1 > fused[1].1);
    }

    #[test]
    fn recency_decay_halves_per_half_life() {
        assert!((recency_decay(0.0, 30.0) - 1.0).abs() < 1e-12);
        assert!((recency_decay(30.0, 30.0) - 0.5).abs() < 1e-12);
        assert!((recency_decay(60.0, 30.0) - 0.25).abs() < 1e-12);
        assert_eq!(recency_decay(10.0, 0.0), 1.0);
    }

    #[test]
    fn merge_expanded_keeps_max_score() {
        let mut results = vec![result(1, 0.5), result(2, 0.1)];
        merge_expanded(&mut results, vec![result(2, 0.3), result(3, 0.2), result(1, 0.1)]);
        sort_results(&mut results);
        let order: Vec<(i64, f64)> = results.iter().map(|r| (r.chunk_idx, r.score)).collect();
        assert_eq!(order, vec![(1, 0.5), (2, 0.3), (3, 0.2)]);
    }

    #[test]
    fn ties_break_by_row_id() {
        let mut results = vec![result(5, 0.2), result(3, 0.2), result(4, 0.9)];
        sort_results(&mut results);
        let ids: Vec<i64> = results.iter().map(|r| r.chunk_idx).collect();
        assert_eq!(ids, vec![4, 3, 5]);
    }
}
