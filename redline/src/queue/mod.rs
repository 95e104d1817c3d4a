//! Durable at-least-once job queue with retry/backoff semantics.
//!
//! The queue delivers each job to exactly one worker per attempt. A failed
//! attempt is re-enqueued with an exponential backoff delay until the
//! attempt budget is exhausted, after which the job is dead-lettered. The
//! backoff and dead-letter decisions are pure functions on [`QueuePolicy`],
//! independent of any particular store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::types::{AnalysisId, Tier, UserId, WorkerId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryJobQueue;
pub use postgres::PgJobQueue;

/// Queue message for one analysis. Immutable once enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub analysis_id: AnalysisId,
    pub user_id: UserId,
    pub storage_path: String,
    pub analysis_type: Tier,
}

/// One delivery of a job to a worker. `attempt` counts prior retries,
/// starting at zero for the first delivery.
#[derive(Debug, Clone)]
pub struct DeliveredJob {
    pub job: AnalysisJob,
    pub attempt: u32,
}

/// Outcome of a single job attempt.
///
/// `RetryableFailure` re-enters the backoff cycle until the attempt budget
/// runs out; `PermanentFailure` dead-letters immediately (the failure cannot
/// recur differently, e.g. a missing source document).
#[derive(Debug)]
pub enum AttemptOutcome {
    Succeeded,
    RetryableFailure(Error),
    PermanentFailure(Error),
}

/// Retry/backoff policy. Defaults match the production queue settings:
/// 3 attempts, exponential backoff with a 5 s base delay.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueuePolicy {
    /// Total attempt budget, including the first delivery.
    pub max_attempts: u32,
    /// Base backoff delay, doubled on each retry.
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    /// Factor by which the delay grows per retry.
    pub backoff_factor: u32,
    /// Upper bound on the backoff delay.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(5000),
            backoff_factor: 2,
            max_delay: Duration::from_secs(300),
        }
    }
}

impl QueuePolicy {
    /// Delay before the retry following attempt number `attempt`
    /// (zero-based): `base * factor^attempt`, capped at `max_delay`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let factor = u64::from(self.backoff_factor);
        let exponential = base_ms.saturating_mul(factor.saturating_pow(attempt));
        Duration::from_millis(exponential.min(self.max_delay.as_millis() as u64))
    }

    /// Whether a job should be dead-lettered instead of retried, given the
    /// number of attempts already consumed.
    pub fn should_dead_letter(&self, attempts_made: u32) -> bool {
        attempts_made >= self.max_attempts
    }
}

/// Durable queue interface. Implementations deliver at-least-once; the
/// status store's idempotent terminal writes absorb duplicate deliveries.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job for its first delivery.
    async fn enqueue(&self, job: &AnalysisJob) -> Result<()>;

    /// Atomically claim up to `limit` deliverable jobs for `worker`.
    async fn claim(&self, limit: usize, worker: WorkerId) -> Result<Vec<DeliveredJob>>;

    /// Acknowledge a successfully processed job, removing it.
    async fn ack(&self, id: AnalysisId) -> Result<()>;

    /// Return a claimed job to pending with an incremented attempt counter,
    /// deliverable no earlier than `not_before`.
    async fn retry(&self, id: AnalysisId, next_attempt: u32, not_before: DateTime<Utc>)
        -> Result<()>;

    /// Move a job to the dead-letter bucket. Terminal.
    async fn dead_letter(&self, id: AnalysisId) -> Result<()>;
}
