use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bound on persisted `error_message` length, so DLQ rows stay small.
pub const ERROR_MESSAGE_MAX_LEN: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            other => Err(format!("invalid state '{other}'")),
        }
    }
}

/// A durable background job. The database row is the single source of
/// truth; this type is a transient in-memory copy valid between a load and
/// the next write-through (see the Job Store's ownership contract).
///
/// All mutation goes through the named transitions below — nothing outside
/// this module should assign to `state`, `attempts`, `updated_at` or
/// `next_retry_at` directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl Job {
    /// Construct a freshly enqueued job in state `pending`.
    pub fn new(id: impl Into<String>, command: impl Into<String>, max_retries: u32) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            created_at: now,
            updated_at: now,
            next_retry_at: None,
            error_message: None,
        }
    }

    /// Transition `pending -> processing`. Called only by a `JobStore`'s
    /// atomic claim, never directly by policy code.
    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.updated_at = now;
    }

    /// Transition to `completed`. Terminal; clears retry bookkeeping.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Increment the attempt counter and, depending on the retry budget,
    /// transition to `failed` (with a scheduled retry) or `dead` (DLQ).
    ///
    /// `backoff_base` and `now` are supplied by the caller (Queue Manager)
    /// so this type stays free of a clock or config dependency.
    ///
    /// A job with `max_retries = N` runs up to `N` times total (one initial
    /// attempt plus `N - 1` retries); the `N`th failure marks it dead.
    pub fn mark_failed(&mut self, error: &str, backoff_base: f64, now: DateTime<Utc>) {
        self.attempts += 1;
        self.error_message = Some(truncate_error(error));
        self.updated_at = now;

        if self.attempts < self.max_retries {
            self.state = JobState::Failed;
            let delay_secs = backoff_base.powi(self.attempts as i32);
            self.next_retry_at =
                Some(now + chrono::Duration::milliseconds((delay_secs * 1000.0) as i64));
        } else {
            self.state = JobState::Dead;
            self.next_retry_at = None;
        }
    }

    /// Transition a retry-ready `failed` job back to `pending` so it
    /// competes with natively-pending jobs in the atomic claim.
    pub fn reactivate_for_retry(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.next_retry_at = None;
        self.updated_at = now;
    }

    /// Reset a `dead` job for replay from the DLQ.
    pub fn reset_for_dlq_retry(&mut self, now: DateTime<Utc>) {
        self.attempts = 0;
        self.state = JobState::Pending;
        self.next_retry_at = None;
        self.error_message = None;
        self.updated_at = now;
    }
}

fn truncate_error(message: &str) -> String {
    if message.chars().count() <= ERROR_MESSAGE_MAX_LEN {
        message.to_string()
    } else {
        message.chars().take(ERROR_MESSAGE_MAX_LEN).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_pending_with_equal_timestamps() {
        let job = Job::new("a", "echo hi", 3);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.created_at, job.updated_at);
        assert!(job.next_retry_at.is_none());
    }

    #[test]
    fn mark_failed_retries_until_budget_exhausted() {
        let mut job = Job::new("a", "false", 3);
        let t0 = Utc::now();

        job.mark_failed("boom", 2.0, t0);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.next_retry_at.is_some());

        job.mark_failed("boom", 2.0, t0);
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 2);

        job.mark_failed("boom", 2.0, t0);
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 3);
        assert!(job.next_retry_at.is_none());
    }

    #[test]
    fn backoff_delay_is_base_pow_attempts() {
        let mut job = Job::new("a", "false", 10);
        let t0 = Utc::now();
        job.mark_failed("boom", 2.0, t0);
        let delay = job.next_retry_at.unwrap() - t0;
        assert_eq!(delay.num_seconds(), 2); // base^1

        job.mark_failed("boom", 2.0, t0);
        let delay = job.next_retry_at.unwrap() - t0;
        assert_eq!(delay.num_seconds(), 4); // base^2
    }

    #[test]
    fn error_message_is_truncated() {
        let mut job = Job::new("a", "false", 3);
        let long = "x".repeat(500);
        job.mark_failed(&long, 2.0, Utc::now());
        assert_eq!(job.error_message.unwrap().len(), ERROR_MESSAGE_MAX_LEN);
    }

    #[test]
    fn dlq_retry_resets_job() {
        let mut job = Job::new("a", "false", 1);
        job.mark_failed("boom", 2.0, Utc::now());
        assert_eq!(job.state, JobState::Dead);

        job.reset_for_dlq_retry(Utc::now());
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.next_retry_at.is_none());
        assert!(job.error_message.is_none());
    }
}
