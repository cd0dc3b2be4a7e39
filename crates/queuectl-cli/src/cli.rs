use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "queuectl", version, about = "Durable background job queue")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Quick way to add a job (no JSON needed).
    Add {
        id: String,
        command: String,
        #[arg(short = 'r', long = "max-retries")]
        max_retries: Option<u32>,
    },

    /// Enqueue a job via --id/--command, a JSON literal, a file, or stdin ("-").
    Enqueue(EnqueueArgs),

    /// List jobs, optionally filtered by state.
    List {
        #[arg(short = 's', long = "state")]
        state: Option<String>,
        #[arg(short = 'l', long = "limit", default_value_t = 10)]
        limit: u32,
    },

    /// Show job statistics, worker status, and configuration.
    Status,

    /// Dead Letter Queue management.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },

    /// Worker process management.
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Args)]
pub struct EnqueueArgs {
    /// JSON literal, or "-" to read JSON from stdin.
    pub job_data: Option<String>,
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,
    #[arg(short = 'i', long = "id")]
    pub id: Option<String>,
    #[arg(short = 'c', long = "command")]
    pub command: Option<String>,
    #[arg(short = 'r', long = "max-retries")]
    pub max_retries: Option<u32>,
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List jobs in the Dead Letter Queue.
    List {
        #[arg(short = 'l', long = "limit", default_value_t = 10)]
        limit: u32,
    },
    /// Requeue a job from the Dead Letter Queue.
    Retry { id: String },
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Start worker processes; blocks until SIGINT/SIGTERM.
    Start {
        #[arg(short = 'c', long = "count", default_value_t = 1)]
        count: u32,
    },
    /// Stop a running worker pool started elsewhere.
    Stop,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Set a configuration value.
    Set { key: String, value: String },
    /// Show current configuration.
    Show,
    /// Reset configuration to defaults.
    Reset,
}
