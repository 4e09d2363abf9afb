//! Outpost CLI - run a desktop node from the terminal
//!
//! Registers the node with its server, runs sync cycles once or on a timer,
//! and gives operators access to the change queue, conflicts and records.

mod cli;
mod commands;
mod error;


use clap::Parser;

use crate::cli::{Cli, Commands, ConflictCommands, QueueCommands};
use crate::commands::conflicts::{run_conflicts_list, run_conflicts_resolve};
use crate::commands::queue::{run_queue_export, run_queue_import, run_queue_list, run_queue_remove};
use crate::commands::record::run_record;
use crate::commands::sync::{run_daemon, run_register, run_status, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("outpost=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let global = cli.global;

    match cli.command {
        Commands::Register {
            code,
            name,
            description,
        } => run_register(&global, &code, &name, description).await?,
        Commands::Sync => run_sync(&global).await?,
        Commands::Daemon => run_daemon(&global).await?,
        Commands::Status => run_status(&global).await?,
        Commands::Queue { command } => match command {
            QueueCommands::List { peer } => run_queue_list(&global, peer.as_deref()).await?,
            QueueCommands::Remove { id } => run_queue_remove(&global, id).await?,
            QueueCommands::Export { peer, path } => {
                run_queue_export(&global, &peer, &path).await?;
            }
            QueueCommands::Import { path } => run_queue_import(&global, &path).await?,
        },
        Commands::Conflicts { command } => match command {
            ConflictCommands::List { pending } => run_conflicts_list(&global, pending).await?,
            ConflictCommands::Resolve { version_id, fields } => {
                run_conflicts_resolve(&global, &version_id, &fields).await?;
            }
        },
        Commands::Record { command } => run_record(&global, &command).await?,
    }

    Ok(())
}
