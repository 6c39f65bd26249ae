use anyhow::Result;

use memoria::config::MemoriaConfig;

/// Display store statistics for one scope.
pub async fn stats(config: &MemoriaConfig, scope: &str) -> Result<()> {
    let memory = super::open_scope(config, scope)?;

    let Some(stats) = memory.stats(config).await? else {
        println!("Semantic memory is disabled (embedding.enabled = false).");
        return Ok(());
    };

    let db_size = std::fs::metadata(memory.db_path()).map(|m| m.len()).unwrap_or(0);

    println!("Memory Statistics ({scope})");
    println!("{}", "=".repeat(40));
    println!("  Files:               {}", stats.files);
    println!("  Active chunks:       {}", stats.active_chunks);
    println!("  Superseded chunks:   {}", stats.superseded_chunks);
    println!("  Cached embeddings:   {}", stats.cached_embeddings);
    println!();
    println!("Scope directory:       {}", memory.root().display());
    println!("Database size:         {db_size} bytes");

    Ok(())
}
