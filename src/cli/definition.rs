//! Command-line definition

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use super::cleanup::CleanupArgs;
use super::start::StartArgs;
use super::status::StatusArgs;
use super::task::TaskCommands;

#[derive(Parser)]
#[command(name = "aoe-sync")]
#[command(about = "Sync a local git checkout with an agent's sandbox workspace")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage sync tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },

    /// Sync a task in the foreground until Ctrl-C
    Start(StartArgs),

    /// Show the active sync, if any
    Status(StatusArgs),

    /// Restore after a crashed sync and remove leftover file-tree sessions
    Cleanup(CleanupArgs),

    /// Generate shell completions
    Completion {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
