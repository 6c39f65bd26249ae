mod helpers;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use helpers::{axis, blend, test_store};
use memoria::config::SearchConfig;
use memoria::memory::format_timestamp;
use memoria::memory::hooks::{
    AdjacentChunkExpander, NeighborExpander, PathPrefixFilter, Reranker, SearchHooks,
};
use memoria::memory::search::{SearchEngine, SearchQuery};
use memoria::memory::store::MemoryStore;
use memoria::memory::types::{ChunkSource, FileRecord, NewChunk, SearchResult};

fn chunk(path: &str, start: usize, content: &str, embedding: Vec<f32>) -> NewChunk {
    NewChunk {
        chunk_key: format!("{path}:{start}"),
        path: path.to_string(),
        source: ChunkSource::Memory,
        session_id: None,
        start_line: start,
        end_line: start + 2,
        content: content.to_string(),
        content_hash: memoria::chunking::hash_text(content),
        token_count: memoria::chunking::estimate_tokens(content),
        embedding,
        embedded_by: None,
    }
}

fn track_file(store: &MemoryStore, path: &str, updated_at: DateTime<Utc>) {
    store
        .upsert_file(&FileRecord {
            path: path.to_string(),
            hash: memoria::chunking::hash_text(path),
            source: ChunkSource::Memory,
            updated_at: format_timestamp(updated_at),
            last_indexed_at: format_timestamp(updated_at),
        })
        .unwrap();
}

fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-06-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn paths(results: &[SearchResult]) -> Vec<&str> {
    results.iter().map(|r| r.path.as_str()).collect()
}

#[tokio::test]
async fn hits_in_both_lists_outrank_single_list_hits() {
    let store = test_store();
    store
        .insert_chunks(&[
            chunk("memory/both.md", 1, "apple banana smoothie", blend(0, 1, 0.3)),
            chunk("memory/vector.md", 1, "zebra crossing", axis(0)),
            chunk("memory/far.md", 1, "cherry pie", axis(5)),
        ])
        .unwrap();
    let engine = SearchEngine::new(store, SearchConfig::default());

    let query = axis(0);
    let results = engine
        .search(&SearchQuery {
            query: "banana",
            embedding: &query,
            top_k: 3,
        })
        .await
        .unwrap();

    assert_eq!(
        paths(&results),
        vec!["memory/both.md", "memory/vector.md", "memory/far.md"]
    );
    let both = &results[0];
    assert!((both.base_score - (0.7 / 62.0 + 0.3 / 61.0)).abs() < 1e-9);
    assert!((results[1].base_score - 0.7 / 61.0).abs() < 1e-9);
    // no file records, so no recency boost; nothing accessed yet
    assert!(results.iter().all(|r| r.recency_boost == 0.0 && r.access_boost == 0.0));
    assert!(results.iter().all(|r| !r.snippet.is_empty()));
}

#[tokio::test]
async fn recent_files_are_boosted() {
    let store = test_store();
    let now = fixed_now();
    track_file(&store, "memory/old.md", now - Duration::days(365));
    track_file(&store, "memory/new.md", now);
    store
        .insert_chunks(&[
            chunk("memory/old.md", 1, "alpha", axis(0)),
            chunk("memory/new.md", 1, "beta", blend(0, 1, 0.2)),
        ])
        .unwrap();

    let query = axis(0);
    let request = SearchQuery {
        query: "gamma",
        embedding: &query,
        top_k: 2,
    };

    let engine = SearchEngine::new(Arc::clone(&store), SearchConfig::default());
    let results = engine.search_at(&request, now).await.unwrap();
    assert_eq!(paths(&results), vec!["memory/new.md", "memory/old.md"]);
    assert!(results[0].base_score < results[1].base_score);
    assert!(results[0].recency_boost > results[1].recency_boost);
    assert!((results[0].recency_boost - results[0].base_score * 0.2).abs() < 1e-9);

    let no_recency = SearchConfig {
        recency_weight: 0.0,
        ..SearchConfig::default()
    };
    let engine = SearchEngine::new(store, no_recency);
    let results = engine.search_at(&request, now).await.unwrap();
    assert_eq!(paths(&results), vec!["memory/old.md", "memory/new.md"]);
}

#[tokio::test]
async fn frequently_used_chunks_are_boosted() {
    let store = test_store();
    let ids = store
        .insert_chunks(&[
            chunk("memory/top.md", 1, "alpha", axis(0)),
            chunk("memory/used.md", 1, "beta", blend(0, 1, 0.2)),
        ])
        .unwrap();
    for _ in 0..20 {
        store.mark_access(&[ids[1]]).unwrap();
    }

    let engine = SearchEngine::new(Arc::clone(&store), SearchConfig::default());
    let query = axis(0);
    let results = engine
        .search(&SearchQuery {
            query: "gamma",
            embedding: &query,
            top_k: 2,
        })
        .await
        .unwrap();

    assert_eq!(paths(&results), vec!["memory/used.md", "memory/top.md"]);
    let expected = results[0].base_score * 0.05 * 21f64.ln();
    assert!((results[0].access_boost - expected).abs() < 1e-9);
    assert_eq!(results[1].access_boost, 0.0);

    // returned chunks are marked as accessed
    assert_eq!(store.get_chunk(ids[0]).unwrap().unwrap().access_count, 1);
    assert_eq!(store.get_chunk(ids[1]).unwrap().unwrap().access_count, 21);
}

#[tokio::test]
async fn results_are_truncated_and_thresholded() {
    let store = test_store();
    store
        .insert_chunks(&[
            chunk("memory/a.md", 1, "alpha", axis(0)),
            chunk("memory/b.md", 1, "beta", axis(1)),
            chunk("memory/c.md", 1, "gamma", axis(2)),
        ])
        .unwrap();
    let query = axis(0);

    let engine = SearchEngine::new(Arc::clone(&store), SearchConfig::default());
    let results = engine
        .search(&SearchQuery {
            query: "nothing",
            embedding: &query,
            top_k: 2,
        })
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].path, "memory/a.md");

    let strict = SearchConfig {
        min_score: 0.7 / 61.5,
        // the first search marked a and b as accessed
        access_weight: 0.0,
        ..SearchConfig::default()
    };
    let engine = SearchEngine::new(store, strict);
    let results = engine
        .search(&SearchQuery {
            query: "nothing",
            embedding: &query,
            top_k: 3,
        })
        .await
        .unwrap();
    assert_eq!(paths(&results), vec!["memory/a.md"]);
}

/// Adds a fixed chunk as a high-scoring expansion candidate.
struct Inject(i64);

#[async_trait]
impl NeighborExpander for Inject {
    async fn expand(&self, store: &MemoryStore, _results: &[SearchResult]) -> Result<Vec<SearchResult>> {
        Ok(store.get_chunk(self.0)?.into_iter().map(|c| promoted(c, 100.0)).collect())
    }
}

/// Puts a fixed chunk at the head of the reranked list.
struct Promote {
    store: Arc<MemoryStore>,
    id: i64,
}

#[async_trait]
impl Reranker for Promote {
    async fn rerank(&self, _query: &str, results: Vec<SearchResult>) -> Result<Vec<SearchResult>> {
        let mut reranked: Vec<SearchResult> = self
            .store
            .get_chunk(self.id)?
            .into_iter()
            .map(|c| promoted(c, 1000.0))
            .collect();
        reranked.extend(results.into_iter().filter(|r| r.chunk_idx != self.id));
        Ok(reranked)
    }
}

fn promoted(chunk: memoria::memory::types::StoredChunk, score: f64) -> SearchResult {
    SearchResult {
        chunk_idx: chunk.id,
        chunk_id: chunk.chunk_key,
        path: chunk.path,
        start_line: chunk.start_line,
        end_line: chunk.end_line,
        content: chunk.content,
        score,
        base_score: score,
        recency_boost: 0.0,
        access_boost: 0.0,
        snippet: String::new(),
    }
}

/// One public chunk and one private chunk that matches the query best.
fn private_fixture() -> (Arc<MemoryStore>, i64, i64) {
    let store = test_store();
    let ids = store
        .insert_chunks(&[
            chunk("memory/public.md", 1, "deploy pipeline overview", blend(0, 1, 0.3)),
            chunk("memory/private/diary.md", 1, "deploy pipeline credentials", axis(0)),
        ])
        .unwrap();
    (store, ids[0], ids[1])
}

async fn run(engine: &SearchEngine) -> Vec<SearchResult> {
    let query = axis(0);
    engine
        .search(&SearchQuery {
            query: "deploy pipeline",
            embedding: &query,
            top_k: 5,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn prefilter_applies_to_retrieval() {
    let (store, public, private) = private_fixture();
    let hooks = SearchHooks::default().with_prefilter(PathPrefixFilter::blocking(["memory/private/"]));
    let engine = SearchEngine::new(Arc::clone(&store), SearchConfig::default()).with_hooks(hooks);

    let results = run(&engine).await;
    assert_eq!(paths(&results), vec!["memory/public.md"]);
    assert_eq!(store.get_chunk(private).unwrap().unwrap().access_count, 0);
    assert_eq!(store.get_chunk(public).unwrap().unwrap().access_count, 1);
}

#[tokio::test]
async fn prefilter_applies_to_expansion() {
    let (store, _public, private) = private_fixture();

    // without a filter the expander does surface the chunk
    let open = SearchEngine::new(Arc::clone(&store), SearchConfig::default())
        .with_hooks(SearchHooks::default().with_expander(Inject(private)));
    assert_eq!(run(&open).await[0].chunk_idx, private);

    let (store, _public, private) = private_fixture();
    let hooks = SearchHooks::default()
        .with_prefilter(PathPrefixFilter::blocking(["memory/private/"]))
        .with_expander(Inject(private));
    let engine = SearchEngine::new(Arc::clone(&store), SearchConfig::default()).with_hooks(hooks);

    let results = run(&engine).await;
    assert!(results.iter().all(|r| r.chunk_idx != private));
    assert_eq!(store.get_chunk(private).unwrap().unwrap().access_count, 0);
}

#[tokio::test]
async fn prefilter_applies_to_reranking() {
    let (store, _public, private) = private_fixture();
    let hooks = SearchHooks::default()
        .with_prefilter(PathPrefixFilter::blocking(["memory/private/"]))
        .with_reranker(Promote {
            store: Arc::clone(&store),
            id: private,
        });
    let engine = SearchEngine::new(Arc::clone(&store), SearchConfig::default()).with_hooks(hooks);

    let results = run(&engine).await;
    assert_eq!(paths(&results), vec!["memory/public.md"]);
    assert_eq!(store.get_chunk(private).unwrap().unwrap().access_count, 0);
}

#[tokio::test]
async fn reranked_order_is_kept() {
    let (store, public, private) = private_fixture();
    let hooks = SearchHooks::default().with_reranker(Promote {
        store: Arc::clone(&store),
        id: public,
    });
    let engine = SearchEngine::new(Arc::clone(&store), SearchConfig::default()).with_hooks(hooks);

    let results = run(&engine).await;
    assert_eq!(results[0].chunk_idx, public);
    assert_eq!(results[0].score, 1000.0);
    assert!(results.iter().any(|r| r.chunk_idx == private));
}

#[tokio::test]
async fn adjacent_expander_returns_discounted_neighbours() {
    let store = test_store();
    let ids = store
        .insert_chunks(&[
            chunk("memory/a.md", 1, "first", axis(1)),
            chunk("memory/a.md", 5, "second", axis(2)),
            chunk("memory/a.md", 9, "third", axis(3)),
            chunk("memory/b.md", 1, "elsewhere", axis(4)),
        ])
        .unwrap();
    let middle = promoted(store.get_chunk(ids[1]).unwrap().unwrap(), 0.4);

    let extra = AdjacentChunkExpander::default()
        .expand(&store, &[middle])
        .await
        .unwrap();
    let mut found: Vec<(i64, f64)> = extra.iter().map(|r| (r.chunk_idx, r.score)).collect();
    found.sort_by_key(|(id, _)| *id);
    assert_eq!(found, vec![(ids[0], 0.2), (ids[2], 0.2)]);
    assert!(extra.iter().all(|r| r.snippet.is_empty()));
}
