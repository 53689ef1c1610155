//! `aoe-sync status` command

use anyhow::Result;
use clap::Args;
use serde::Serialize;

use crate::config::Config;
use crate::sync::{LocalSyncMessage, SyncSessionInfo};
use crate::task::TaskStore;

#[derive(Args)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct StatusJson {
    active: Option<SyncSessionInfo>,
    last_message: Option<LocalSyncMessage>,
    last_message_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub async fn run(config: &Config, args: StatusArgs) -> Result<()> {
    let store = super::open_store(config)?;
    let active = store.load_sync_record()?;
    let last = match &active {
        Some(info) => store.messages(&info.task_id)?.pop(),
        None => None,
    };

    if args.json {
        let status = StatusJson {
            active,
            last_message_at: last.as_ref().map(|m| m.recorded_at),
            last_message: last.map(|m| m.message),
        };
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let Some(info) = active else {
        println!("No active sync.");
        return Ok(());
    };
    println!("Task:            {}", info.task_id);
    println!("Project:         {}", info.project_id);
    println!("Sync branch:     {}", info.sync_branch);
    println!("Original branch: {}", info.original_branch);
    println!("Session:         {}", info.sync_name);
    if let Some(last) = last {
        println!(
            "Last update:     {} ({})",
            last.message.summary(),
            last.recorded_at.format("%Y-%m-%d %H:%M:%S")
        );
        for notice in last.message.all_notices() {
            println!("  {}", notice.describe());
        }
    }
    Ok(())
}
