mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use bucketdb::{config::load_or_default, logging};

use crate::commands::{
    compact::CompactArgs, document::DocCommands, reindex::ReindexArgs, serve::ServeArgs,
};

#[derive(Parser)]
#[command(author, version, about = "bucketdb object-store document CLI")]
struct Cli {
    /// Path to the configuration file. Defaults to ~/.config/bucketdb/config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Merge per-id manifests into hash-sharded NDJSON files
    Compact(CompactArgs),
    /// Run the change-notification and read service
    Serve(ServeArgs),
    /// Write and read documents
    Doc {
        #[command(subcommand)]
        command: DocCommands,
    },
    /// Rebuild index pointers from the stored snapshots
    Reindex(ReindexArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();
    let (config, _config_path) = load_or_default(config)?;
    logging::init(&config.logging)?;

    match command {
        Commands::Compact(args) => commands::compact::execute(config, args).await?,
        Commands::Serve(args) => commands::serve::execute(config, args).await?,
        Commands::Doc { command } => commands::document::execute(config, command).await?,
        Commands::Reindex(args) => commands::reindex::execute(config, args).await?,
    }

    Ok(())
}
