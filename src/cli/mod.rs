//! CLI command implementations

pub mod cleanup;
pub mod definition;
pub mod start;
pub mod status;
pub mod task;

pub use definition::{Cli, Commands};

use anyhow::Result;
use std::sync::Arc;

use crate::config::Config;
use crate::sync::{LocalSyncManager, MutagenBackend};
use crate::task::JsonTaskStore;

pub fn open_store(config: &Config) -> Result<Arc<JsonTaskStore>> {
    Ok(Arc::new(JsonTaskStore::new(config.data_dir()?)?))
}

/// Manager wired to the on-disk task store and the mutagen backend
pub fn build_manager(config: &Config, store: Arc<JsonTaskStore>) -> Result<LocalSyncManager> {
    let backend = MutagenBackend::new(
        config.filetree_data_dir()?,
        config.filetree.session_prefix.clone(),
    )
    .with_excluded_subpaths(config.sync.excluded_subpaths.clone());
    if !backend.is_available() {
        tracing::warn!("mutagen not found on PATH, file-tree sync will fail");
    }
    Ok(LocalSyncManager::from_config(
        config,
        store,
        Arc::new(backend),
    ))
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else if max <= 3 {
        s.chars().take(max).collect()
    } else {
        let head: String = s.chars().take(max - 3).collect();
        format!("{}...", head)
    }
}
