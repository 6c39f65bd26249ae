mod helpers;

use std::sync::Arc;

use helpers::{write_file, FailingProvider, HashingProvider};
use memoria::config::MemoriaConfig;
use memoria::embedding::EmbeddingProvider;
use memoria::memory::hooks::{PathPrefixFilter, SearchHooks};
use memoria::{MemoryRegistry, SearchOutcome, SemanticMemory, SyncOutcome};

fn hashing() -> Vec<Arc<dyn EmbeddingProvider>> {
    vec![Arc::new(HashingProvider::new())]
}

#[tokio::test]
async fn remembered_fact_is_found_then_forgotten() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoriaConfig::default();
    let memory = SemanticMemory::new("chat-42", dir.path()).with_providers(hashing());

    write_file(dir.path(), "memory/prefs.md", "# Preferences\n\nremember: I like X\n");

    let results = memory
        .search("X", Some(1), &config)
        .await
        .unwrap()
        .into_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "memory/prefs.md");
    assert!(results[0].content.contains("I like X"));
    assert!(results[0].snippet.contains("I like X"));
    assert!(memory.db_path().exists());

    std::fs::remove_file(dir.path().join("memory/prefs.md")).unwrap();
    let results = memory
        .search("X", Some(5), &config)
        .await
        .unwrap()
        .into_results();
    assert!(results.iter().all(|r| r.path != "memory/prefs.md"));

    let stats = memory.stats(&config).await.unwrap().unwrap();
    assert_eq!(stats.files, 0);
    assert_eq!(stats.active_chunks, 0);
    assert_eq!(stats.superseded_chunks, 1);
}

#[tokio::test]
async fn disabled_memory_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MemoriaConfig::default();
    config.embedding.enabled = false;
    let memory = SemanticMemory::new("chat", dir.path()).with_providers(hashing());
    write_file(dir.path(), "memory/prefs.md", "remember: I like X\n");

    assert_eq!(memory.sync(&config).await.unwrap(), SyncOutcome::Disabled);
    assert_eq!(
        memory.search("X", None, &config).await.unwrap(),
        SearchOutcome::Disabled
    );
    assert!(memory.stats(&config).await.unwrap().is_none());
    assert!(!memory.db_path().exists());
}

#[tokio::test]
async fn search_without_sync_on_search_sees_only_synced_content() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MemoriaConfig::default();
    config.sync.on_search = false;
    let memory = SemanticMemory::new("chat", dir.path()).with_providers(hashing());

    write_file(dir.path(), "memory/a.md", "the launch codename is bluebird\n");
    let results = memory.search("bluebird", None, &config).await.unwrap().into_results();
    assert!(results.is_empty());

    match memory.sync(&config).await.unwrap() {
        SyncOutcome::Completed(report) => assert_eq!(report.files_indexed, 1),
        SyncOutcome::Disabled => panic!("memory should be enabled"),
    }
    let results = memory.search("bluebird", None, &config).await.unwrap().into_results();
    assert_eq!(results.len(), 1);
}

#[tokio::test]
async fn blank_queries_return_no_results() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(HashingProvider::new());
    let providers: Vec<Arc<dyn EmbeddingProvider>> = vec![provider.clone()];
    let memory = SemanticMemory::new("chat", dir.path()).with_providers(providers);
    write_file(dir.path(), "memory/a.md", "some note\n");

    let outcome = memory.search("   ", None, &MemoriaConfig::default()).await.unwrap();
    assert_eq!(outcome, SearchOutcome::Results(Vec::new()));
    // the pre-search sync embedded the note, the blank query was never embedded
    assert_eq!(provider.texts_embedded(), 1);
}

#[tokio::test]
async fn provider_failure_is_an_error_not_an_empty_result() {
    let dir = tempfile::tempdir().unwrap();
    let providers: Vec<Arc<dyn EmbeddingProvider>> =
        vec![Arc::new(FailingProvider::new("down", 500))];
    let memory = SemanticMemory::new("chat", dir.path()).with_providers(providers);

    let err = memory
        .search("anything", None, &MemoriaConfig::default())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("down"));
}

#[tokio::test]
async fn registry_scopes_are_isolated() {
    let dir = tempfile::tempdir().unwrap();
    let config = MemoriaConfig::default();
    let registry = MemoryRegistry::new(dir.path())
        .with_providers(hashing())
        .with_hooks(SearchHooks::default().with_prefilter(PathPrefixFilter::blocking(["memory/private/"])));

    let alice = registry.scope("alice").unwrap();
    let bob = registry.scope("bob").unwrap();
    write_file(alice.root(), "memory/notes.md", "alice prefers tea\n");
    write_file(alice.root(), "memory/private/diary.md", "alice secretly prefers coffee\n");
    write_file(bob.root(), "memory/notes.md", "bob prefers coffee\n");

    let results = alice.search("coffee", Some(5), &config).await.unwrap().into_results();
    assert!(results.iter().all(|r| !r.content.contains("coffee")));
    assert!(results.iter().any(|r| r.content.contains("alice prefers tea")));

    let results = bob.search("coffee", Some(5), &config).await.unwrap().into_results();
    assert_eq!(results.len(), 1);
    assert!(results[0].content.contains("bob"));

    assert_ne!(alice.db_path(), bob.db_path());
    assert!(alice.db_path().starts_with(dir.path().join("scopes").join("alice")));
}
