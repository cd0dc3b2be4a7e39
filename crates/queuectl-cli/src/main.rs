//! `queuectl` — durable, single-node background job runner.
//!
//! Wires the storage-agnostic policy layer (`queuectl-core`) to the SQLite
//! backend (`queuectl-sqlite`), parses the CLI surface, and owns the
//! Worker/WorkerPool lifecycle. Nothing here lives at process-static
//! scope; everything is constructed in `main` and passed down explicitly.

mod cli;
mod commands;
mod pool;
mod worker;

use std::sync::Arc;

use clap::Parser;
use cli::{Cli, Command};
use queuectl_core::{Config, QueueManager, SystemClock};
use queuectl_sqlite::SqliteJobStore;

const DB_FILE: &str = "queuectl.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("\u{274c} Error: {err}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = Config::default_path();
    let mut config = Config::load(&config_path)?;

    // `config` subcommands only need the file, not the database, so handle
    // them before paying for a store connection.
    if let Command::Config { command } = cli.command {
        return commands::config_cmd(&mut config, &config_path, command);
    }

    let store = Arc::new(SqliteJobStore::connect(DB_FILE).await?);
    let queue = Arc::new(QueueManager::new(store, Arc::new(SystemClock), config).await?);
    let runtime = tokio::runtime::Handle::current();

    match cli.command {
        Command::Add {
            id,
            command,
            max_retries,
        } => commands::add(&queue, &id, &command, max_retries).await,
        Command::Enqueue(args) => commands::enqueue(&queue, args).await,
        Command::List { state, limit } => commands::list(&queue, state, limit).await,
        Command::Status => commands::status(&queue, pool::PoolStatus::default()).await,
        Command::Dlq { command } => commands::dlq(&queue, command).await,
        Command::Worker { command } => commands::worker(queue, runtime, command).await,
        Command::Config { .. } => unreachable!("handled above"),
    }
}
