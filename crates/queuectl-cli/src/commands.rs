use std::io::Read as _;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use queuectl_core::{Config, JobState, QueueManager};
use serde::Deserialize;
use tokio::runtime::Handle;

use crate::cli::{ConfigCommand, DlqCommand, EnqueueArgs, WorkerCommand};
use crate::pool::WorkerPool;

const PID_FILE: &str = "queuectl.pid";

#[derive(Deserialize)]
struct EnqueueJson {
    id: String,
    command: String,
    max_retries: Option<u32>,
}

pub async fn add(
    queue: &QueueManager,
    id: &str,
    command: &str,
    max_retries: Option<u32>,
) -> anyhow::Result<()> {
    let job = queue.enqueue(id, command, max_retries).await?;
    println!("\u{2713} Job added successfully");
    println!("  ID:          {}", job.id);
    println!("  Command:     {}", job.command);
    println!("  Max Retries: {}", job.max_retries);
    Ok(())
}

pub async fn enqueue(queue: &QueueManager, args: EnqueueArgs) -> anyhow::Result<()> {
    let (id, command, max_retries) = if let (Some(id), Some(command)) = (&args.id, &args.command) {
        (id.clone(), command.clone(), args.max_retries)
    } else {
        let raw = if let Some(path) = &args.file {
            std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?
        } else if args.job_data.as_deref() == Some("-") {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        } else if let Some(data) = &args.job_data {
            data.clone()
        } else {
            bail!("either provide JSON or use --id and --command");
        };

        let parsed: EnqueueJson = serde_json::from_str(&raw).context("invalid JSON format")?;
        (parsed.id, parsed.command, parsed.max_retries)
    };

    let job = queue.enqueue(&id, &command, max_retries).await?;
    println!("\u{2713} Job enqueued successfully");
    println!("  ID:          {}", job.id);
    println!("  Command:     {}", job.command);
    println!("  Max Retries: {}", job.max_retries);
    println!("  Created:     {}", job.created_at.to_rfc3339());
    Ok(())
}

pub async fn list(queue: &QueueManager, state: Option<String>, limit: u32) -> anyhow::Result<()> {
    let state = state
        .map(|s| JobState::from_str(&s))
        .transpose()
        .map_err(anyhow::Error::msg)?;
    let jobs = queue.list(state, limit).await?;

    if jobs.is_empty() {
        println!("No jobs found");
        return Ok(());
    }

    println!(
        "\n{:<20} {:<12} {:<35} {:<10} Updated",
        "ID", "State", "Command", "Attempts"
    );
    println!("{}", "-".repeat(110));
    for job in &jobs {
        let cmd_preview = preview(&job.command, 35);
        println!(
            "{:<20} {:<12} {:<35} {:<10} {}",
            job.id,
            job.state,
            cmd_preview,
            format!("{}/{}", job.attempts, job.max_retries),
            job.updated_at.to_rfc3339(),
        );
    }
    println!("\nShowing {} job(s)", jobs.len());
    Ok(())
}

pub async fn status(
    queue: &QueueManager,
    pool_status: crate::pool::PoolStatus,
) -> anyhow::Result<()> {
    let stats = queue.stats().await?;
    let config = queue.config();

    println!("{}", "=".repeat(60));
    println!("queuectl Status");
    println!("{}", "=".repeat(60));

    println!("\nJob Statistics:");
    println!("  Pending:    {:>5}", stats.pending);
    println!("  Processing: {:>5}", stats.processing);
    println!("  Completed:  {:>5}", stats.completed);
    println!("  Failed:     {:>5}", stats.failed);
    println!("  Dead (DLQ): {:>5}", stats.dead);
    println!("  {}", "-".repeat(20));
    println!("  Total:      {:>5}", stats.total());

    println!("\nWorkers:");
    println!("  Total:      {:>5}", pool_status.total);
    println!("  Active:     {:>5}", pool_status.active);
    println!("  Busy:       {:>5}", pool_status.busy);
    println!("  Idle:       {:>5}", pool_status.idle);

    println!("\nConfiguration:");
    println!("  Max Retries:   {}", config.max_retries);
    println!("  Backoff Base:  {}", config.backoff_base);
    println!("  Job Timeout:   {}s", config.job_timeout);
    println!("{}", "=".repeat(60));
    Ok(())
}

pub async fn dlq(queue: &QueueManager, command: DlqCommand) -> anyhow::Result<()> {
    match command {
        DlqCommand::List { limit } => {
            let jobs = queue.list(Some(JobState::Dead), limit).await?;
            if jobs.is_empty() {
                println!("\u{2713} No jobs in Dead Letter Queue");
                return Ok(());
            }
            println!("\n{:<20} {:<45} {:<10} Error", "ID", "Command", "Attempts");
            println!("{}", "-".repeat(120));
            for job in &jobs {
                let error_preview = job
                    .error_message
                    .as_deref()
                    .map(|e| preview(e, 30))
                    .unwrap_or_else(|| "N/A".to_string());
                println!(
                    "{:<20} {:<45} {:<10} {}",
                    job.id,
                    preview(&job.command, 45),
                    job.attempts,
                    error_preview
                );
            }
            println!("\n{} job(s) in Dead Letter Queue", jobs.len());
            println!("   Use 'queuectl dlq retry <job-id>' to retry a job");
        }
        DlqCommand::Retry { id } => {
            if queue.retry_dlq(&id).await? {
                println!("\u{2713} Job '{id}' moved from DLQ back to pending queue");
            } else {
                bail!("job '{id}' not found in Dead Letter Queue");
            }
        }
    }
    Ok(())
}

pub async fn worker(
    queue: Arc<QueueManager>,
    runtime: Handle,
    command: WorkerCommand,
) -> anyhow::Result<()> {
    match command {
        WorkerCommand::Start { count } => start_workers(queue, runtime, count).await,
        WorkerCommand::Stop => stop_workers(),
    }
}

async fn start_workers(
    queue: Arc<QueueManager>,
    runtime: Handle,
    count: u32,
) -> anyhow::Result<()> {
    let config = queue.config().clone();
    let pool = Arc::new(WorkerPool::new(
        queue,
        runtime,
        Duration::from_secs(config.job_timeout),
        Duration::from_secs(config.poll_interval),
        Duration::from_secs(config.worker_shutdown_timeout),
    ));
    pool.start(count)?;
    std::fs::write(PID_FILE, std::process::id().to_string())?;

    println!("\u{2713} Started {count} worker(s)");
    println!("  Workers are processing jobs...");
    println!("  Press Ctrl+C to stop workers gracefully\n");

    pool.run_until_shutdown().await;

    println!("\n\u{26a0} Stopping workers gracefully...");
    pool.stop();
    let _ = std::fs::remove_file(PID_FILE);
    println!("\u{2713} All workers stopped");
    Ok(())
}

/// Used when another process manages the pool: reads the pidfile left by
/// `worker start` and asks it to shut down over a plain OS signal, since
/// no other inter-process transport is assumed.
fn stop_workers() -> anyhow::Result<()> {
    let pid_text = std::fs::read_to_string(PID_FILE)
        .context("no running worker pool found (queuectl.pid missing)")?;
    let pid: i32 = pid_text.trim().parse().context("corrupt pidfile")?;

    // SAFETY: `pid` is a plain integer read from our own pidfile; signaling
    // a nonexistent process just returns ESRCH, which we ignore.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("failed to signal worker process {pid}");
    }
    println!("\u{2713} Sent shutdown signal to worker process {pid}");
    Ok(())
}

pub fn config_cmd(config: &mut Config, path: &Path, command: ConfigCommand) -> anyhow::Result<()> {
    match command {
        ConfigCommand::Set { key, value } => {
            config.set_key(&key, &value, path)?;
            println!("\u{2713} Configuration updated");
            println!("  {key} = {value}");
        }
        ConfigCommand::Show => {
            println!("\nCurrent Configuration:");
            println!("{}", "-".repeat(40));
            println!("  max-retries:   {}", config.max_retries);
            println!("  backoff-base:  {}", config.backoff_base);
            println!("  job-timeout:   {}s", config.job_timeout);
            println!("  poll-interval: {}s", config.poll_interval);
            println!(
                "  worker-shutdown-timeout: {}s",
                config.worker_shutdown_timeout
            );
            println!("{}", "-".repeat(40));
        }
        ConfigCommand::Reset => {
            print!("Are you sure you want to reset configuration to defaults? [y/N] ");
            use std::io::Write as _;
            std::io::stdout().flush()?;
            let mut answer = String::new();
            std::io::stdin().read_line(&mut answer)?;
            if answer.trim().eq_ignore_ascii_case("y") {
                *config = Config::default();
                config.save(path)?;
                println!("\u{2713} Configuration reset to defaults");
            } else {
                println!("Cancelled");
            }
        }
    }
    Ok(())
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let truncated: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{truncated}...")
    } else {
        s.to_string()
    }
}
