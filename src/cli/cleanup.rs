//! `aoe-sync cleanup` command

use anyhow::Result;
use clap::Args;

use crate::config::Config;
use crate::task::TaskStore;

#[derive(Args)]
pub struct CleanupArgs {}

pub async fn run(config: &Config, _args: CleanupArgs) -> Result<()> {
    let store = super::open_store(config)?;
    let recorded = store.load_sync_record()?;
    let manager = super::build_manager(config, store)?;

    tokio::task::spawn_blocking(move || {
        manager.cleanup_current_sync();
        manager.start_service();
    })
    .await?;

    match recorded {
        Some(info) => println!(
            "✓ Cleaned up sync for task {}, restored branch {}",
            info.task_id, info.original_branch
        ),
        None => println!("✓ No recorded sync, removed any leftover file-tree sessions"),
    }
    Ok(())
}
