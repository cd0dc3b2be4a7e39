//! WorkerPool: lifecycle of N Workers and signal-driven shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use queuectl_core::QueueManager;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tracing::info;

use crate::worker::Worker;

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct PoolStatus {
    pub total: usize,
    pub active: usize,
    pub busy: usize,
    pub idle: usize,
}

/// Owns a set of [`Worker`]s and the pool's own SIGINT/SIGTERM shutdown
/// event. `workers` is mutated only from the thread that calls
/// `start`/`stop` (the CLI's main thread); `status()` reads are
/// lock-free-ish and best-effort.
pub struct WorkerPool {
    workers: Mutex<Vec<Worker>>,
    queue: Arc<QueueManager>,
    runtime: Handle,
    job_timeout: Duration,
    poll_interval: Duration,
    worker_shutdown_timeout: Duration,
    shutdown_requested: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl WorkerPool {
    /// Builds the pool and installs its shutdown-signal handler
    /// immediately: the handler is bound to this pool's own stop event,
    /// so every `WorkerPool` gets its own independent, idempotent
    /// installation and multiple pools can coexist in the same process
    /// (e.g. in tests) without one's shutdown affecting another's.
    pub fn new(
        queue: Arc<QueueManager>,
        runtime: Handle,
        job_timeout: Duration,
        poll_interval: Duration,
        worker_shutdown_timeout: Duration,
    ) -> Self {
        let shutdown_requested = Arc::new(AtomicBool::new(false));
        let shutdown_notify = Arc::new(Notify::new());

        let task_requested = shutdown_requested.clone();
        let task_notify = shutdown_notify.clone();
        runtime.spawn(async move {
            wait_for_signal().await;
            task_requested.store(true, Ordering::SeqCst);
            task_notify.notify_one();
        });

        Self {
            workers: Mutex::new(Vec::new()),
            queue,
            runtime,
            job_timeout,
            poll_interval,
            worker_shutdown_timeout,
            shutdown_requested,
            shutdown_notify,
        }
    }

    /// Spawn `count` workers with sequential ids starting at 1.
    pub fn start(&self, count: u32) -> anyhow::Result<()> {
        if count < 1 {
            anyhow::bail!("worker count must be at least 1");
        }
        let mut workers = self.workers.lock().unwrap();
        for i in 1..=count {
            workers.push(Worker::spawn(
                i,
                self.queue.clone(),
                self.runtime.clone(),
                self.job_timeout,
                self.poll_interval,
            ));
        }
        Ok(())
    }

    /// Waits for this pool's installed shutdown signal, logging the
    /// pool's busy/idle roll-up every few seconds in the meantime.
    pub async fn run_until_shutdown(&self) {
        if self.shutdown_requested.load(Ordering::SeqCst) {
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        ticker.tick().await; // first tick fires immediately; skip it
        loop {
            tokio::select! {
                _ = self.shutdown_notify.notified() => return,
                _ = ticker.tick() => {
                    let status = self.status();
                    tracing::debug!(?status, "pool status");
                }
            }
        }
    }

    /// Signal every worker to stop, then join each up to
    /// `worker_shutdown_timeout`. Workers still mid-job when the timeout
    /// expires are abandoned and have their child's process group killed
    /// directly; any job they held stays `processing` and is recovered on
    /// next startup via `reset_processing`.
    pub fn stop(&self) {
        let workers: Vec<Worker> = std::mem::take(&mut *self.workers.lock().unwrap());
        if workers.is_empty() {
            return;
        }

        info!("stopping {} worker(s)", workers.len());
        for worker in &workers {
            worker.request_stop();
        }

        for mut worker in workers {
            let id = worker.id();
            let finished = worker.join(self.worker_shutdown_timeout);
            if !finished {
                worker.kill_current_child();
                info!(
                    worker = id,
                    "abandoned after shutdown timeout; killed its child process group"
                );
            }
        }
        info!("all workers stopped");
    }

    pub fn status(&self) -> PoolStatus {
        let workers = self.workers.lock().unwrap();
        let total = workers.len();
        let active = workers.iter().filter(|w| !w.is_stopped()).count();
        let busy = workers.iter().filter(|w| w.is_busy()).count();
        PoolStatus {
            total,
            active,
            busy,
            idle: active.saturating_sub(busy),
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::{Config, SystemClock};
    use queuectl_sqlite::SqliteJobStore;

    async fn new_queue() -> Arc<QueueManager> {
        let store = Arc::new(SqliteJobStore::connect_in_memory().await.unwrap());
        Arc::new(
            QueueManager::new(store, Arc::new(SystemClock), Config::default())
                .await
                .unwrap(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_reports_idle_workers_with_no_jobs() {
        let queue = new_queue().await;
        let pool = WorkerPool::new(
            queue,
            Handle::current(),
            Duration::from_secs(5),
            Duration::from_millis(20),
            Duration::from_secs(2),
        );
        pool.start(3).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;

        let status = pool.status();
        assert_eq!(status.total, 3);
        assert_eq!(status.active, 3);
        assert_eq!(status.busy, 0);
        assert_eq!(status.idle, 3);

        pool.stop();
        let status = pool.status();
        assert_eq!(status.total, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_reports_busy_worker_mid_job() {
        let queue = new_queue().await;
        queue.enqueue("slow", "sleep 2", None).await.unwrap();
        let pool = WorkerPool::new(
            queue,
            Handle::current(),
            Duration::from_secs(5),
            Duration::from_millis(20),
            Duration::from_secs(2),
        );
        pool.start(1).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = pool.status();
        assert_eq!(status.busy, 1);
        assert_eq!(status.idle, 0);

        pool.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_rejects_zero_count() {
        let queue = new_queue().await;
        let pool = WorkerPool::new(
            queue,
            Handle::current(),
            Duration::from_secs(5),
            Duration::from_millis(20),
            Duration::from_secs(2),
        );
        assert!(pool.start(0).is_err());
    }
}
