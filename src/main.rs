mod cli;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use memoria::config::MemoriaConfig;

#[derive(Parser)]
#[command(name = "memoria", version, about = "Per-scope semantic memory: index notes and transcripts, search them")]
struct Cli {
    /// Config file (defaults to ~/.memoria/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Reconcile a scope's index with its files
    Sync {
        #[arg(long)]
        scope: String,
    },
    /// Search a scope
    Search {
        #[arg(long)]
        scope: String,
        /// Maximum number of results
        #[arg(long)]
        top_k: Option<usize>,
        query: String,
    },
    /// Show store statistics for a scope
    Stats {
        #[arg(long)]
        scope: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => MemoriaConfig::load_from(path)?,
        None => MemoriaConfig::load()?,
    };

    // stdout carries command output, logs go to stderr
    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Sync { scope } => cli::sync::sync(&config, &scope).await?,
        Command::Search { scope, top_k, query } => {
            cli::search::search(&config, &scope, &query, top_k).await?
        }
        Command::Stats { scope } => cli::stats::stats(&config, &scope).await?,
    }

    Ok(())
}
