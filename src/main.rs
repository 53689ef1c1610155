//! aoe-sync - keep a local checkout in sync with an agent's sandbox

use aoe_sync::cli::{self, Cli, Commands};
use aoe_sync::config::Config;
use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    if std::env::var("AOE_SYNC_DEBUG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter("aoe_sync=debug")
            .with_writer(std::io::stderr)
            .init();
    } else if std::env::var("RUST_LOG").is_ok() {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .init();
    }

    let cli = Cli::parse();

    // Completions need neither config nor the task store
    if let Commands::Completion { shell } = cli.command {
        generate(shell, &mut Cli::command(), "aoe-sync", &mut std::io::stdout());
        return Ok(());
    }

    let config = Config::load()?;
    match cli.command {
        Commands::Task { command } => cli::task::run(&config, command).await,
        Commands::Start(args) => cli::start::run(&config, args).await,
        Commands::Status(args) => cli::status::run(&config, args).await,
        Commands::Cleanup(args) => cli::cleanup::run(&config, args).await,
        Commands::Completion { .. } => Ok(()),
    }
}
