//! SQLite-backed [`JobStore`] implementation.
//!
//! Implements atomic claim via a conditional `UPDATE`, exponential-backoff
//! retry scheduling, and dead-letter semantics against a single local
//! `*.db` file, matching this system's single-node deployment model.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS jobs (
//!     id TEXT PRIMARY KEY,
//!     command TEXT NOT NULL,
//!     state TEXT NOT NULL,
//!     attempts INTEGER NOT NULL,
//!     max_retries INTEGER NOT NULL,
//!     created_at TEXT NOT NULL,
//!     updated_at TEXT NOT NULL,
//!     next_retry_at TEXT,
//!     error_message TEXT
//! );
//! CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state);
//! CREATE INDEX IF NOT EXISTS idx_jobs_next_retry ON jobs(next_retry_at) WHERE state = 'failed';
//! CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
//! ```
//!
//! ## Concurrency
//!
//! `claim_next_pending` combines the select-oldest and conditional-update
//! steps into one `UPDATE ... RETURNING` statement using a correlated
//! subquery, so a single SQLite statement is already atomic with respect
//! to SQLite's own transaction isolation. A `tokio::sync::Mutex`
//! additionally serializes every mutating call against the same store
//! instance, avoiding `SQLITE_BUSY` errors under concurrent Workers
//! sharing one connection pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use queuectl_core::{Job, JobState, JobStore, QueueStats};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A [`JobStore`] backed by a SQLite database file.
pub struct SqliteJobStore {
    pool: SqlitePool,
    // Serializes mutating operations so the select-then-update claim
    // sequence and the retry/DLQ writes never interleave across Workers
    // sharing this store.
    write_lock: Arc<Mutex<()>>,
}

impl SqliteJobStore {
    /// Open (creating if absent) the SQLite database file at `path` and
    /// run schema migrations.
    pub async fn connect(path: &str) -> anyhow::Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{path}"))?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.migrate().await?;
        Ok(store)
    }

    /// Open an in-memory database — used by tests that need a hermetic,
    /// disk-free store.
    pub async fn connect_in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
        };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                command TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                next_retry_at TEXT,
                error_message TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_next_retry ON jobs(next_retry_at) WHERE state = 'failed'",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_job(row: &sqlx::sqlite::SqliteRow) -> anyhow::Result<Job> {
    let state: String = row.try_get("state")?;
    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        state: JobState::from_str(&state).map_err(anyhow::Error::msg)?,
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        max_retries: row.try_get::<i64, _>("max_retries")? as u32,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        next_retry_at: row.try_get("next_retry_at")?,
        error_message: row.try_get("error_message")?,
    })
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn save(&self, job: &Job) -> anyhow::Result<()> {
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, command, state, attempts, max_retries, created_at, updated_at, next_retry_at, error_message)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                command = excluded.command,
                state = excluded.state,
                attempts = excluded.attempts,
                max_retries = excluded.max_retries,
                updated_at = excluded.updated_at,
                next_retry_at = excluded.next_retry_at,
                error_message = excluded.error_message
            "#,
        )
        .bind(&job.id)
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(job.attempts as i64)
        .bind(job.max_retries as i64)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(job.next_retry_at)
        .bind(&job.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> anyhow::Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn claim_next_pending(&self) -> anyhow::Result<Option<Job>> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'processing', updated_at = ?
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            AND state = 'pending'
            RETURNING *
            "#,
        )
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_job).transpose()
    }

    async fn retryable_ready(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE state = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?
            ORDER BY next_retry_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_job).collect()
    }

    async fn list(&self, state: Option<JobState>, limit: u32) -> anyhow::Result<Vec<Job>> {
        let rows = if let Some(state) = state {
            sqlx::query("SELECT * FROM jobs WHERE state = ? ORDER BY updated_at DESC LIMIT ?")
                .bind(state.as_str())
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
        } else {
            sqlx::query("SELECT * FROM jobs ORDER BY updated_at DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?
        };

        rows.iter().map(row_to_job).collect()
    }

    async fn stats(&self) -> anyhow::Result<QueueStats> {
        let rows = sqlx::query("SELECT state, COUNT(*) as count FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            match JobState::from_str(&state).map_err(anyhow::Error::msg)? {
                JobState::Pending => stats.pending = count as u64,
                JobState::Processing => stats.processing = count as u64,
                JobState::Completed => stats.completed = count as u64,
                JobState::Failed => stats.failed = count as u64,
                JobState::Dead => stats.dead = count as u64,
            }
        }
        Ok(stats)
    }

    async fn delete(&self, id: &str) -> anyhow::Result<bool> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn reset_processing(&self) -> anyhow::Result<u64> {
        let _guard = self.write_lock.lock().await;
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET state = 'pending', updated_at = ? WHERE state = 'processing'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup_old(&self, days: i64, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let _guard = self.write_lock.lock().await;
        let cutoff = now - chrono::Duration::days(days);
        let result = sqlx::query("DELETE FROM jobs WHERE state = 'completed' AND updated_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::Job;

    async fn store() -> SqliteJobStore {
        SqliteJobStore::connect_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn save_and_get_round_trip() {
        let store = store().await;
        let job = Job::new("a", "echo hi", 3);
        store.save(&job).await.unwrap();
        let loaded = store.get("a").await.unwrap().unwrap();
        assert_eq!(loaded.id, "a");
        assert_eq!(loaded.command, "echo hi");
    }

    #[tokio::test]
    async fn claim_next_pending_picks_oldest_and_is_idempotent() {
        let store = store().await;
        let mut a = Job::new("a", "true", 3);
        let mut b = Job::new("b", "true", 3);
        // Force a's created_at strictly earlier so ordering is deterministic.
        a.created_at -= chrono::Duration::seconds(5);
        a.updated_at = a.created_at;
        b.created_at -= chrono::Duration::seconds(1);
        b.updated_at = b.created_at;
        store.save(&a).await.unwrap();
        store.save(&b).await.unwrap();

        let claimed = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(claimed.id, "a");
        assert_eq!(claimed.state, JobState::Processing);

        let second = store.claim_next_pending().await.unwrap().unwrap();
        assert_eq!(second.id, "b");

        assert!(store.claim_next_pending().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reset_processing_recovers_crashed_jobs() {
        let store = store().await;
        let job = Job::new("a", "true", 3);
        store.save(&job).await.unwrap();
        store.claim_next_pending().await.unwrap();

        let reset = store.reset_processing().await.unwrap();
        assert_eq!(reset, 1);

        let job = store.get("a").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
    }

    #[tokio::test]
    async fn stats_counts_match_rows() {
        let store = store().await;
        store.save(&Job::new("a", "true", 3)).await.unwrap();
        store.save(&Job::new("b", "true", 3)).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.total(), 2);
    }

    #[tokio::test]
    async fn cleanup_old_removes_only_stale_completed_jobs() {
        let store = store().await;
        let mut old = Job::new("old", "true", 3);
        old.mark_completed(Utc::now() - chrono::Duration::days(40));
        let mut recent = Job::new("recent", "true", 3);
        recent.mark_completed(Utc::now());
        store.save(&old).await.unwrap();
        store.save(&recent).await.unwrap();

        let deleted = store.cleanup_old(30, Utc::now()).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get("old").await.unwrap().is_none());
        assert!(store.get("recent").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn retryable_ready_filters_by_next_retry_at() {
        let store = store().await;
        let mut job = Job::new("a", "false", 5);
        job.mark_failed("boom", 2.0, Utc::now() - chrono::Duration::seconds(10));
        store.save(&job).await.unwrap();

        let ready = store.retryable_ready(Utc::now()).await.unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "a");
    }
}
