use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{QueueCtlError, Result};
use crate::job::{Job, JobState};
use crate::store::{JobStore, QueueStats};

/// Enforces job lifecycle policy on top of a [`JobStore`].
///
/// Construction resets any jobs stuck in `processing` (crash recovery);
/// callers should build exactly one `QueueManager` per process per store.
pub struct QueueManager {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    config: Config,
}

impl QueueManager {
    /// Build a manager over `store`, running the startup recovery hook
    /// (`reset_processing`) exactly once.
    pub async fn new(
        store: Arc<dyn JobStore>,
        clock: Arc<dyn Clock>,
        config: Config,
    ) -> Result<Self> {
        let reset = store
            .reset_processing()
            .await
            .map_err(QueueCtlError::Storage)?;
        if reset > 0 {
            info!(count = reset, "reset jobs stuck in processing on startup");
        }
        Ok(Self {
            store,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Enqueue a new job. Fails with `AlreadyExists` on a duplicate id, or
    /// `InvalidArgument` on an empty id/command.
    pub async fn enqueue(&self, id: &str, command: &str, max_retries: Option<u32>) -> Result<Job> {
        if id.trim().is_empty() {
            return Err(QueueCtlError::InvalidArgument(
                "job id must not be empty".into(),
            ));
        }
        if command.trim().is_empty() {
            return Err(QueueCtlError::InvalidArgument(
                "command must not be empty".into(),
            ));
        }

        if self
            .store
            .get(id)
            .await
            .map_err(QueueCtlError::Storage)?
            .is_some()
        {
            return Err(QueueCtlError::AlreadyExists(id.to_string()));
        }

        let max_retries = max_retries.unwrap_or(self.config.max_retries);
        let job = Job::new(id, command, max_retries);
        self.store
            .save(&job)
            .await
            .map_err(QueueCtlError::Storage)?;
        debug!(id = %job.id, "enqueued job");
        Ok(job)
    }

    /// Select the next job for a Worker to run. First reactivates any
    /// retry-ready `failed` jobs back to `pending` (a harmless race: a
    /// duplicate reactivation is a no-op), then performs the atomic claim.
    pub async fn next_job(&self) -> Result<Option<Job>> {
        let now = self.clock.now();
        let ready = self
            .store
            .retryable_ready(now)
            .await
            .map_err(QueueCtlError::Storage)?;

        if let Some(mut job) = ready.into_iter().next() {
            job.reactivate_for_retry(now);
            self.store
                .save(&job)
                .await
                .map_err(QueueCtlError::Storage)?;
            debug!(id = %job.id, "reactivated retry-ready job");
        }

        self.store
            .claim_next_pending()
            .await
            .map_err(QueueCtlError::Storage)
    }

    pub async fn mark_completed(&self, job: &mut Job) -> Result<()> {
        job.mark_completed(self.clock.now());
        self.store.save(job).await.map_err(QueueCtlError::Storage)?;
        debug!(id = %job.id, "job completed");
        Ok(())
    }

    /// Increment attempts and either schedule a retry or move the job to
    /// the Dead Letter Queue, using the `backoff_base ^ attempts` delay.
    pub async fn mark_failed(&self, job: &mut Job, error: &str) -> Result<()> {
        let now = self.clock.now();
        job.mark_failed(error, self.config.backoff_base, now);

        if job.state == JobState::Dead {
            info!(id = %job.id, attempts = job.attempts, "job moved to dead letter queue");
        } else {
            debug!(
                id = %job.id,
                next_retry_at = ?job.next_retry_at,
                "job scheduled for retry"
            );
        }

        self.store.save(job).await.map_err(QueueCtlError::Storage)
    }

    /// Replay a `dead` job. Returns `false` if the id is unknown or not in
    /// `dead`.
    pub async fn retry_dlq(&self, id: &str) -> Result<bool> {
        let Some(mut job) = self.store.get(id).await.map_err(QueueCtlError::Storage)? else {
            return Ok(false);
        };
        if job.state != JobState::Dead {
            return Ok(false);
        }
        job.reset_for_dlq_retry(self.clock.now());
        self.store
            .save(&job)
            .await
            .map_err(QueueCtlError::Storage)?;
        info!(id = %job.id, "job requeued from dead letter queue");
        Ok(true)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>> {
        self.store.get(id).await.map_err(QueueCtlError::Storage)
    }

    pub async fn list(&self, state: Option<JobState>, limit: u32) -> Result<Vec<Job>> {
        self.store
            .list(state, limit)
            .await
            .map_err(QueueCtlError::Storage)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.store.stats().await.map_err(QueueCtlError::Storage)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(id).await.map_err(QueueCtlError::Storage)
    }

    pub async fn cleanup_old(&self, days: i64) -> Result<u64> {
        self.store
            .cleanup_old(days, self.clock.now())
            .await
            .map_err(QueueCtlError::Storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;

    /// A minimal in-memory JobStore for exercising QueueManager policy
    /// without a database.
    #[derive(Default)]
    struct MemStore {
        jobs: Mutex<std::collections::HashMap<String, Job>>,
    }

    #[async_trait]
    impl JobStore for MemStore {
        async fn save(&self, job: &Job) -> anyhow::Result<()> {
            self.jobs
                .lock()
                .unwrap()
                .insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn get(&self, id: &str) -> anyhow::Result<Option<Job>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn claim_next_pending(&self) -> anyhow::Result<Option<Job>> {
            let mut jobs = self.jobs.lock().unwrap();
            let mut candidates: Vec<_> = jobs
                .values()
                .filter(|j| j.state == JobState::Pending)
                .cloned()
                .collect();
            candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
            if let Some(mut job) = candidates.into_iter().next() {
                job.mark_processing(Utc::now());
                jobs.insert(job.id.clone(), job.clone());
                Ok(Some(job))
            } else {
                Ok(None)
            }
        }

        async fn retryable_ready(&self, now: DateTime<Utc>) -> anyhow::Result<Vec<Job>> {
            let jobs = self.jobs.lock().unwrap();
            let mut ready: Vec<_> = jobs
                .values()
                .filter(|j| {
                    j.state == JobState::Failed && j.next_retry_at.is_some_and(|t| t <= now)
                })
                .cloned()
                .collect();
            ready.sort_by_key(|j| j.next_retry_at);
            Ok(ready)
        }

        async fn list(&self, state: Option<JobState>, limit: u32) -> anyhow::Result<Vec<Job>> {
            let jobs = self.jobs.lock().unwrap();
            let mut all: Vec<_> = jobs
                .values()
                .filter(|j| state.is_none_or(|s| j.state == s))
                .cloned()
                .collect();
            all.sort_by_key(|b| std::cmp::Reverse(b.updated_at));
            all.truncate(limit as usize);
            Ok(all)
        }

        async fn stats(&self) -> anyhow::Result<QueueStats> {
            let jobs = self.jobs.lock().unwrap();
            let mut stats = QueueStats::default();
            for job in jobs.values() {
                match job.state {
                    JobState::Pending => stats.pending += 1,
                    JobState::Processing => stats.processing += 1,
                    JobState::Completed => stats.completed += 1,
                    JobState::Failed => stats.failed += 1,
                    JobState::Dead => stats.dead += 1,
                }
            }
            Ok(stats)
        }

        async fn delete(&self, id: &str) -> anyhow::Result<bool> {
            Ok(self.jobs.lock().unwrap().remove(id).is_some())
        }

        async fn reset_processing(&self) -> anyhow::Result<u64> {
            let mut jobs = self.jobs.lock().unwrap();
            let mut count = 0;
            for job in jobs.values_mut() {
                if job.state == JobState::Processing {
                    job.state = JobState::Pending;
                    job.updated_at = Utc::now();
                    count += 1;
                }
            }
            Ok(count)
        }

        async fn cleanup_old(&self, days: i64, now: DateTime<Utc>) -> anyhow::Result<u64> {
            let mut jobs = self.jobs.lock().unwrap();
            let cutoff = now - chrono::Duration::days(days);
            let to_remove: Vec<_> = jobs
                .values()
                .filter(|j| j.state == JobState::Completed && j.updated_at < cutoff)
                .map(|j| j.id.clone())
                .collect();
            for id in &to_remove {
                jobs.remove(id);
            }
            Ok(to_remove.len() as u64)
        }
    }

    async fn new_manager() -> QueueManager {
        let store = Arc::new(MemStore::default());
        QueueManager::new(store, Arc::new(SystemClock), Config::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_rejects_duplicate_id() {
        let qm = new_manager().await;
        qm.enqueue("a", "true", None).await.unwrap();
        let err = qm.enqueue("a", "true", None).await.unwrap_err();
        assert!(matches!(err, QueueCtlError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn enqueue_rejects_empty_fields() {
        let qm = new_manager().await;
        assert!(qm.enqueue("", "true", None).await.is_err());
        assert!(qm.enqueue("a", "", None).await.is_err());
    }

    #[tokio::test]
    async fn next_job_claims_oldest_pending() {
        let qm = new_manager().await;
        qm.enqueue("a", "true", None).await.unwrap();
        qm.enqueue("b", "true", None).await.unwrap();

        let job = qm.next_job().await.unwrap().unwrap();
        assert_eq!(job.id, "a");
        assert_eq!(job.state, JobState::Processing);
    }

    #[tokio::test]
    async fn dlq_round_trip_resets_job() {
        let qm = new_manager().await;
        let mut job = qm.enqueue("a", "false", Some(1)).await.unwrap();

        qm.mark_failed(&mut job, "boom").await.unwrap();
        assert_eq!(job.state, JobState::Dead);

        assert!(qm.retry_dlq("a").await.unwrap());
        let job = qm.get("a").await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.next_retry_at.is_none());
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn retry_dlq_rejects_non_dead_job() {
        let qm = new_manager().await;
        qm.enqueue("a", "true", None).await.unwrap();
        assert!(!qm.retry_dlq("a").await.unwrap());
        assert!(!qm.retry_dlq("missing").await.unwrap());
    }

    #[tokio::test]
    async fn stats_total_matches_sum_of_states() {
        let qm = new_manager().await;
        qm.enqueue("a", "true", None).await.unwrap();
        qm.enqueue("b", "true", None).await.unwrap();
        let stats = qm.stats().await.unwrap();
        assert_eq!(stats.total(), 2);
        assert_eq!(stats.pending, 2);
    }
}
