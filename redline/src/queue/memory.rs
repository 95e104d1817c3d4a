//! In-memory queue with the same delivery semantics as the Postgres
//! implementation. Used by tests and single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{AnalysisJob, DeliveredJob, JobQueue};
use crate::errors::{Error, Result};
use crate::types::{AnalysisId, WorkerId};

#[derive(Debug, Clone)]
struct QueuedJob {
    job: AnalysisJob,
    attempt: u32,
    not_before: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Inner {
    pending: Vec<QueuedJob>,
    claimed: HashMap<AnalysisId, QueuedJob>,
    dead: Vec<AnalysisJob>,
}

#[derive(Default)]
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs awaiting delivery (including backoff delays).
    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Ids in the dead-letter bucket, in arrival order.
    pub fn dead_letter_ids(&self) -> Vec<AnalysisId> {
        self.inner.lock().dead.iter().map(|j| j.analysis_id).collect()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.is_empty() && inner.claimed.is_empty()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: &AnalysisJob) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.pending.push(QueuedJob {
            job: job.clone(),
            attempt: 0,
            not_before: None,
        });
        Ok(())
    }

    async fn claim(&self, limit: usize, worker: WorkerId) -> Result<Vec<DeliveredJob>> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let mut delivered = Vec::new();

        let mut i = 0;
        while i < inner.pending.len() && delivered.len() < limit {
            let eligible = match inner.pending[i].not_before {
                Some(t) => t <= now,
                None => true,
            };
            if eligible {
                let queued = inner.pending.remove(i);
                tracing::debug!(
                    analysis_id = %queued.job.analysis_id,
                    worker = %worker,
                    attempt = queued.attempt,
                    "claimed job"
                );
                delivered.push(DeliveredJob {
                    job: queued.job.clone(),
                    attempt: queued.attempt,
                });
                inner.claimed.insert(queued.job.analysis_id, queued);
            } else {
                i += 1;
            }
        }

        Ok(delivered)
    }

    async fn ack(&self, id: AnalysisId) -> Result<()> {
        let mut inner = self.inner.lock();
        inner
            .claimed
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("claimed job"))
    }

    async fn retry(
        &self,
        id: AnalysisId,
        next_attempt: u32,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut queued = inner
            .claimed
            .remove(&id)
            .ok_or_else(|| Error::not_found("claimed job"))?;
        queued.attempt = next_attempt;
        queued.not_before = Some(not_before);
        inner.pending.push(queued);
        Ok(())
    }

    async fn dead_letter(&self, id: AnalysisId) -> Result<()> {
        let mut inner = self.inner.lock();
        let queued = inner
            .claimed
            .remove(&id)
            .ok_or_else(|| Error::not_found("claimed job"))?;
        inner.dead.push(queued.job);
        Ok(())
    }
}
