use anyhow::Result;

use memoria::config::MemoriaConfig;
use memoria::memory::facade::SyncOutcome;

/// Reconcile a scope with its files and print what changed.
pub async fn sync(config: &MemoriaConfig, scope: &str) -> Result<()> {
    let memory = super::open_scope(config, scope)?;

    let report = match memory.sync(config).await? {
        SyncOutcome::Disabled => {
            println!("Semantic memory is disabled (embedding.enabled = false).");
            return Ok(());
        }
        SyncOutcome::Completed(report) => report,
    };

    println!("Sync of scope '{scope}'");
    println!("{}", "=".repeat(40));
    println!("  Files scanned:       {}", report.files_scanned);
    println!("  Indexed:             {}", report.files_indexed);
    println!("  Unchanged:           {}", report.files_unchanged);
    println!("  Removed:             {}", report.files_removed);
    println!();
    println!("  Chunks inserted:     {}", report.chunks_inserted);
    println!("  Chunks superseded:   {}", report.chunks_superseded);
    println!("    linked:            {}", report.chunks_linked);
    println!("  Embeddings computed: {}", report.embeddings_computed);
    println!("  Embeddings reused:   {}", report.embeddings_reused);
    if report.cache_entries_evicted > 0 {
        println!("  Cache evicted:       {}", report.cache_entries_evicted);
    }
    if let Some(provider) = &report.provider {
        println!("  Provider:            {provider}");
    }

    Ok(())
}
