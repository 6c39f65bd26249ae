use anyhow::Result;

use memoria::config::MemoriaConfig;
use memoria::memory::facade::SearchOutcome;

/// Run a search from the terminal.
pub async fn search(config: &MemoriaConfig, scope: &str, query: &str, top_k: Option<usize>) -> Result<()> {
    let memory = super::open_scope(config, scope)?;

    let results = match memory.search(query, top_k, config).await? {
        SearchOutcome::Disabled => {
            println!("Semantic memory is disabled (embedding.enabled = false).");
            return Ok(());
        }
        SearchOutcome::Results(results) => results,
    };

    if results.is_empty() {
        println!("No results found.");
        return Ok(());
    }

    println!("Found {} result(s)\n", results.len());

    for (i, result) in results.iter().enumerate() {
        println!(
            "  {}. {}:{}-{} (score: {:.4}, base: {:.4}, recency: {:.4}, access: {:.4})",
            i + 1,
            result.path,
            result.start_line,
            result.end_line,
            result.score,
            result.base_score,
            result.recency_boost,
            result.access_boost,
        );
        println!("     {}", result.snippet.replace('\n', " "));
        println!();
    }

    Ok(())
}
