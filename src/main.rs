mod commands;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::commands::{
    config::ConfigArgs, ingest::IngestArgs, logs::LogsCommands, remote::RemoteCommands,
    start::StartArgs, stats::StatsCommands,
};

#[derive(Parser)]
#[command(author, version, about = "chainlog event indexer CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.chainlog/config.toml
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the indexer HTTP server in the foreground
    Start(StartArgs),
    /// Apply a file (or stdin) of contract events to the local index
    Ingest(IngestArgs),
    /// Query indexed log entries
    Logs {
        #[command(subcommand)]
        command: LogsCommands,
    },
    /// Show aggregate statistics
    Stats {
        #[command(subcommand)]
        command: StatsCommands,
    },
    /// Update system configuration
    Config(ConfigArgs),
    /// Query remote chainlog indexers
    Remote {
        #[command(subcommand)]
        command: RemoteCommands,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    if !matches!(command, Commands::Start(_)) {
        logging::init_console();
    }

    match command {
        Commands::Start(args) => commands::start::execute(config, args).await?,
        Commands::Ingest(args) => commands::ingest::execute(config, args).await?,
        Commands::Logs { command } => commands::logs::execute(config, command)?,
        Commands::Stats { command } => commands::stats::execute(config, command)?,
        Commands::Config(args) => commands::config::execute(config, args)?,
        Commands::Remote { command } => commands::remote::execute(config, command).await?,
    }

    Ok(())
}
