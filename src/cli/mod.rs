pub mod search;
pub mod stats;
pub mod sync;

use anyhow::Result;
use std::sync::Arc;

use memoria::config::MemoriaConfig;
use memoria::memory::facade::{MemoryRegistry, SemanticMemory};

/// Resolve the scope handle for a command.
pub fn open_scope(config: &MemoriaConfig, scope: &str) -> Result<Arc<SemanticMemory>> {
    MemoryRegistry::from_config(config).scope(scope)
}
