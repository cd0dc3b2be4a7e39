//! Worker: a single job-processing loop running on its own OS thread.
//!
//! Each [`Worker`] is a literal OS thread running a synchronous poll loop.
//! The store and child-process calls it makes are `async`, so the thread
//! drives them to completion with [`tokio::runtime::Handle::block_on`]
//! against a runtime shared by the whole pool — the thread itself never
//! yields mid-iteration the way an async task would.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use queuectl_core::{Job, QueueManager};
use tokio::process::Command;
use tokio::runtime::Handle;
use tracing::{info, warn};

/// The job a worker is currently running, including the process group id
/// of its child so it can be killed as a unit from outside the worker's
/// own thread (the abandon-on-shutdown-timeout path in [`crate::pool`]).
struct RunningJob {
    job_id: String,
    pgid: i32,
}

/// A single worker thread: polls the queue, runs one job's command at a
/// time, and reports the outcome back through the [`QueueManager`].
pub struct Worker {
    id: u32,
    stop: Arc<AtomicBool>,
    current: Arc<Mutex<Option<RunningJob>>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    /// Spawn the worker thread immediately.
    pub fn spawn(
        id: u32,
        queue: Arc<QueueManager>,
        runtime: Handle,
        job_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let current = Arc::new(Mutex::new(None));

        let thread_stop = stop.clone();
        let thread_current = current.clone();
        let handle = std::thread::Builder::new()
            .name(format!("queuectl-worker-{id}"))
            .spawn(move || {
                run_loop(
                    id,
                    queue,
                    runtime,
                    job_timeout,
                    poll_interval,
                    thread_stop,
                    thread_current,
                )
            })
            .expect("failed to spawn worker thread");

        Self {
            id,
            stop,
            current,
            handle: Some(handle),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Signal this worker to stop at the top of its next loop iteration.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Kill the process group of whatever child this worker currently has
    /// running, if any. Used when a worker is abandoned after
    /// `worker_shutdown_timeout` expires (its thread may be blocked past
    /// the pool's patience) so no child is left running as an orphan.
    pub fn kill_current_child(&self) {
        if let Some(job) = self.current.lock().unwrap().as_ref() {
            // SAFETY: `pgid` is the id of a process group this worker
            // created via `process_group(0)`; signaling a group that has
            // already exited just returns ESRCH, which we ignore.
            let result = unsafe { libc::kill(-job.pgid, libc::SIGKILL) };
            if result != 0 {
                warn!(job = %job.job_id, pgid = job.pgid, "failed to kill abandoned job's process group");
            }
        }
    }

    /// Block until the thread exits or `timeout` elapses. Returns whether
    /// it exited in time.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let Some(handle) = self.handle.take() else {
            return true;
        };
        join_with_timeout(handle, timeout)
    }
}

/// `std::thread::JoinHandle` has no timed join, so we poll a watcher
/// channel instead: the worker thread signals completion, and we wait on
/// that signal with a timeout.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let (tx, rx) = std::sync::mpsc::channel();
    let watcher = std::thread::spawn(move || {
        let _ = handle.join();
        let _ = tx.send(());
    });
    let finished = rx.recv_timeout(timeout).is_ok();
    if !finished {
        warn!("worker thread did not stop within shutdown timeout; abandoning it");
    }
    // The watcher itself always finishes once `handle` does; we don't wait
    // on it further so a slow worker can't block process shutdown twice.
    drop(watcher);
    finished
}

fn run_loop(
    id: u32,
    queue: Arc<QueueManager>,
    runtime: Handle,
    job_timeout: Duration,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    current: Arc<Mutex<Option<RunningJob>>>,
) {
    info!(worker = id, "started");
    while !stop.load(Ordering::SeqCst) {
        let next = runtime.block_on(queue.next_job());
        match next {
            Ok(Some(mut job)) => {
                info!(worker = id, job = %job.id, "claimed job");
                runtime.block_on(execute(&queue, &mut job, job_timeout, &current));
                *current.lock().unwrap() = None;
            }
            Ok(None) => {
                std::thread::sleep(poll_interval);
            }
            Err(err) => {
                warn!(worker = id, error = %err, "store error, retrying after poll interval");
                std::thread::sleep(poll_interval);
            }
        }
    }
    info!(worker = id, "stopped");
}

/// Run `job.command` through the system shell with a wall-clock timeout,
/// then record the outcome against the job's retry/DLQ state machine.
///
/// The child is placed in its own process group (`process_group(0)`) so
/// that on timeout we can kill the whole group, not just the shell:
/// `kill_on_drop` alone only ever signals the single `/bin/sh` process,
/// leaving any further children it forked (a pipeline, a backgrounded
/// job, a script that forks a worker of its own) running past the
/// deadline.
async fn execute(
    queue: &QueueManager,
    job: &mut Job,
    job_timeout: Duration,
    current: &Mutex<Option<RunningJob>>,
) {
    let mut command = Command::new("/bin/sh");
    command
        .arg("-c")
        .arg(&job.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            let _ = queue.mark_failed(job, "Command not found").await;
            return;
        }
        Err(err) => {
            let _ = queue
                .mark_failed(job, &format!("Execution error: {err}"))
                .await;
            return;
        }
    };

    // `process_group(0)` makes the child its own group leader, so its pid
    // doubles as the pgid to target with a group-wide kill.
    let pgid = child.id().map(|pid| pid as i32);
    if let Some(pgid) = pgid {
        *current.lock().unwrap() = Some(RunningJob {
            job_id: job.id.clone(),
            pgid,
        });
    }

    match tokio::time::timeout(job_timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            if output.status.success() {
                let _ = queue.mark_completed(job).await;
            } else {
                let code = output.status.code().unwrap_or(-1);
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stderr_preview: String = stderr.chars().take(200).collect();
                let message = if stderr_preview.is_empty() {
                    format!("Command exited with code {code}")
                } else {
                    format!("Command exited with code {code}: {stderr_preview}")
                };
                let _ = queue.mark_failed(job, &message).await;
            }
        }
        Ok(Err(err)) => {
            let _ = queue
                .mark_failed(job, &format!("Execution error: {err}"))
                .await;
        }
        Err(_) => {
            if let Some(pgid) = pgid {
                // SAFETY: `pgid` is this child's own group, created above.
                let _ = unsafe { libc::kill(-pgid, libc::SIGKILL) };
            }
            let _ = queue
                .mark_failed(
                    job,
                    &format!("Command timed out after {} seconds", job_timeout.as_secs()),
                )
                .await;
        }
    }
}
