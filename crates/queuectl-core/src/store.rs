use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::job::{Job, JobState};

/// Per-state row counts, as returned by [`JobStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

/// Durable, concurrency-safe persistence of [`Job`] records.
///
/// Implementations own the only copy of job state that matters; callers
/// hold transient in-memory snapshots. In particular,
/// [`JobStore::claim_next_pending`] must be serialisable with respect to
/// itself: two concurrent callers must never observe the same `id`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Upsert a job by id. Total write.
    async fn save(&self, job: &Job) -> anyhow::Result<()>;

    /// Point lookup by id.
    async fn get(&self, id: &str) -> anyhow::Result<Option<Job>>;

    /// Atomically claim the oldest pending job, transitioning it to
    /// `processing`. Returns `None` if no pending row exists or the
    /// candidate was claimed by a concurrent caller first.
    async fn claim_next_pending(&self) -> anyhow::Result<Option<Job>>;

    /// All `failed` rows whose `next_retry_at` has elapsed, ordered by
    /// `next_retry_at` ascending.
    async fn retryable_ready(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Job>>;

    /// Most-recent-first listing, optionally filtered by state, bounded by
    /// `limit`.
    async fn list(&self, state: Option<JobState>, limit: u32) -> anyhow::Result<Vec<Job>>;

    /// Row counts per state.
    async fn stats(&self) -> anyhow::Result<QueueStats>;

    /// Remove a job by id. Returns whether a row was deleted.
    async fn delete(&self, id: &str) -> anyhow::Result<bool>;

    /// Reset every `processing` row back to `pending`. Called once at
    /// startup to recover jobs marooned by a crash. Returns the count
    /// reset.
    async fn reset_processing(&self) -> anyhow::Result<u64>;

    /// Delete `completed` rows last updated before `now - days`.
    async fn cleanup_old(&self, days: i64, now: DateTime<Utc>) -> anyhow::Result<u64>;
}
