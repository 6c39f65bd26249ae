//! Extension points of the search pipeline.
//!
//! Each hook is a strategy trait with a no-op default, bundled into
//! [`SearchHooks`] and injected when the engine is built:
//!
//! - [`CandidateFilter`] decides which chunks a caller may see. The engine
//!   applies it to retrieval hits, to expansion output and to reranker
//!   output, so no stage can reintroduce a blocked chunk.
//! - [`NeighborExpander`] adds extra candidates (e.g. adjacent chunks).
//! - [`Reranker`] reorders or rescores the final candidate list.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::memory::store::MemoryStore;
use crate::memory::types::SearchResult;

/// What a [`CandidateFilter`] gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct CandidateView<'a> {
    pub chunk_idx: i64,
    pub path: &'a str,
    pub start_line: usize,
    pub end_line: usize,
    pub content: &'a str,
}

impl<'a> CandidateView<'a> {
    pub fn of(result: &'a SearchResult) -> Self {
        Self {
            chunk_idx: result.chunk_idx,
            path: &result.path,
            start_line: result.start_line,
            end_line: result.end_line,
            content: &result.content,
        }
    }
}

pub trait CandidateFilter: Send + Sync {
    /// `false` removes the candidate from every stage of the search.
    fn allow(&self, candidate: &CandidateView<'_>) -> bool;
}

impl<F> CandidateFilter for F
where
    F: Fn(&CandidateView<'_>) -> bool + Send + Sync,
{
    fn allow(&self, candidate: &CandidateView<'_>) -> bool {
        self(candidate)
    }
}

/// Lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl CandidateFilter for AllowAll {
    fn allow(&self, _candidate: &CandidateView<'_>) -> bool {
        true
    }
}

/// Blocks every chunk whose path starts with one of the given prefixes.
#[derive(Debug, Clone, Default)]
pub struct PathPrefixFilter {
    blocked: Vec<String>,
}

impl PathPrefixFilter {
    pub fn blocking<I, S>(prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            blocked: prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl CandidateFilter for PathPrefixFilter {
    fn allow(&self, candidate: &CandidateView<'_>) -> bool {
        !self
            .blocked
            .iter()
            .any(|prefix| candidate.path.starts_with(prefix.as_str()))
    }
}

#[async_trait]
pub trait NeighborExpander: Send + Sync {
    /// Extra candidates to merge into `results`. Returned results with an
    /// empty `snippet` get one filled in by the engine.
    async fn expand(&self, store: &MemoryStore, results: &[SearchResult]) -> Result<Vec<SearchResult>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoExpansion;

#[async_trait]
impl NeighborExpander for NoExpansion {
    async fn expand(&self, _store: &MemoryStore, _results: &[SearchResult]) -> Result<Vec<SearchResult>> {
        Ok(Vec::new())
    }
}

/// Pulls in the active chunks just before and after each hit in the same
/// file, scored at `discount` times the hit's score.
#[derive(Debug, Clone, Copy)]
pub struct AdjacentChunkExpander {
    pub discount: f64,
}

impl Default for AdjacentChunkExpander {
    fn default() -> Self {
        Self { discount: 0.5 }
    }
}

#[async_trait]
impl NeighborExpander for AdjacentChunkExpander {
    async fn expand(&self, store: &MemoryStore, results: &[SearchResult]) -> Result<Vec<SearchResult>> {
        let mut extra = Vec::new();
        for result in results {
            for neighbour in store.get_adjacent_chunks(&result.path, result.start_line)? {
                let score = result.score * self.discount;
                extra.push(SearchResult {
                    chunk_idx: neighbour.id,
                    chunk_id: neighbour.chunk_key,
                    path: neighbour.path,
                    start_line: neighbour.start_line,
                    end_line: neighbour.end_line,
                    content: neighbour.content,
                    score,
                    base_score: score,
                    recency_boost: 0.0,
                    access_boost: 0.0,
                    snippet: String::new(),
                });
            }
        }
        Ok(extra)
    }
}

#[async_trait]
pub trait Reranker: Send + Sync {
    /// Reorder or rescore `results`. The returned order is kept as is.
    async fn rerank(&self, query: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeepOrder;

#[async_trait]
impl Reranker for KeepOrder {
    async fn rerank(&self, _query: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>> {
        Ok(results)
    }
}

#[derive(Clone)]
pub struct SearchHooks {
    pub prefilter: Arc<dyn CandidateFilter>,
    pub expander: Arc<dyn NeighborExpander>,
    pub reranker: Arc<dyn Reranker>,
}

impl Default for SearchHooks {
    fn default() -> Self {
        Self {
            prefilter: Arc::new(AllowAll),
            expander: Arc::new(NoExpansion),
            reranker: Arc::new(KeepOrder),
        }
    }
}

impl SearchHooks {
    pub fn with_prefilter(mut self, prefilter: impl CandidateFilter + 'static) -> Self {
        self.prefilter = Arc::new(prefilter);
        self
    }

    pub fn with_expander(mut self, expander: impl NeighborExpander + 'static) -> Self {
        self.expander = Arc::new(expander);
        self
    }

    pub fn with_reranker(mut self, reranker: impl Reranker + 'static) -> Self {
        self.reranker = Arc::new(reranker);
        self
    }
}

impl std::fmt::Debug for SearchHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchHooks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(path: &str) -> CandidateView<'_> {
        CandidateView {
            chunk_idx: 1,
            path,
            start_line: 1,
            end_line: 1,
            content: "",
        }
    }

    #[test]
    fn path_prefix_filter_blocks_prefixes() {
        let filter = PathPrefixFilter::blocking(["memory/private/"]);
        assert!(!filter.allow(&view("memory/private/diary.md")));
        assert!(filter.allow(&view("memory/shared.md")));
    }

    fn markdown_only(candidate: &CandidateView<'_>) -> bool {
        candidate.path.ends_with(".md")
    }

    #[test]
    fn functions_are_filters() {
        let hooks = SearchHooks::default().with_prefilter(markdown_only);
        assert!(hooks.prefilter.allow(&view("a.md")));
        assert!(!hooks.prefilter.allow(&view("a.jsonl")));
    }

    #[tokio::test]
    async fn defaults_are_no_ops() {
        let hooks = SearchHooks::default();
        assert!(hooks.prefilter.allow(&view("anything")));
        let reranked = hooks.reranker.rerank("q", Vec::new()).await.unwrap();
        assert!(reranked.is_empty());
    }
}
