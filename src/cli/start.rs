//! `aoe-sync start` command

use anyhow::Result;
use clap::Args;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::sync::{LocalSyncHighLevelStatus, LocalSyncManager, LocalSyncMessage};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Args)]
pub struct StartArgs {
    /// Task ID to sync
    pub task: String,
}

pub async fn run(config: &Config, args: StartArgs) -> Result<()> {
    let store = super::open_store(config)?;
    let manager = Arc::new(super::build_manager(config, store)?);

    let service = manager.clone();
    tokio::task::spawn_blocking(move || service.start_service()).await?;

    let starting = manager.clone();
    let task_id = args.task.clone();
    let info = match tokio::task::spawn_blocking(move || starting.sync_to_task(&task_id)).await? {
        Ok(info) => info,
        Err(e) if e.is_expected() => {
            eprintln!("{}", e);
            anyhow::bail!("Sync for task {} was not started", args.task);
        }
        Err(e) => return Err(e.into()),
    };

    println!(
        "Syncing task {} on branch {} (was on {}). Press Ctrl-C to stop.",
        info.task_id, info.sync_branch, info.original_branch
    );
    watch_until_interrupted(&manager).await;

    println!("Stopping sync...");
    let stopping = manager.clone();
    let task_id = args.task.clone();
    let stopped = tokio::task::spawn_blocking(move || {
        let result = stopping.unsync_from_task(&task_id, false);
        stopping.stop_service();
        result
    })
    .await?;
    stopped?;
    println!("✓ Sync stopped, restored branch {}", info.original_branch);
    Ok(())
}

async fn watch_until_interrupted(manager: &LocalSyncManager) {
    let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
    let mut last_status: Option<LocalSyncHighLevelStatus> = None;
    let mut last_message: Option<LocalSyncMessage> = None;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = ticker.tick() => {}
        }

        let session = manager.current_session();
        let status = session
            .as_ref()
            .map(|s| s.high_level_status())
            .unwrap_or(LocalSyncHighLevelStatus::Stopped);
        if last_status != Some(status) {
            println!("[{}]", status);
            last_status = Some(status);
        }

        let message = session.as_ref().and_then(|s| s.last_sent_message());
        if message != last_message {
            if let Some(message) = &message {
                print_message(message);
            }
            last_message = message;
        }

        if status == LocalSyncHighLevelStatus::Stopped {
            if let Some(failure) = session.and_then(|s| s.watcher_failure()) {
                eprintln!("Local watcher stopped: {}", failure);
            }
            return;
        }
    }
}

fn print_message(message: &LocalSyncMessage) {
    println!("  {}", message.summary());
    for notice in message.all_notices() {
        println!("    {}", notice.describe());
    }
}
