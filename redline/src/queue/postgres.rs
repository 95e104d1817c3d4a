//! Postgres-backed durable queue.
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent workers never receive
//! the same delivery, and a `not_before` column carries the exponential
//! backoff deadline. Stale claims (from crashed workers) are returned to
//! pending before each claim round.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use super::{AnalysisJob, DeliveredJob, JobQueue};
use crate::errors::{Error, Result};
use crate::types::{AnalysisId, Tier, UserId, WorkerId};

pub struct PgJobQueue {
    pool: PgPool,
    stale_claim_timeout: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, stale_claim_timeout: Duration) -> Self {
        Self {
            pool,
            stale_claim_timeout,
        }
    }

    /// Return claims older than the stale timeout to pending. Self-healing
    /// for worker crashes; the attempt counter is preserved.
    async fn unclaim_stale(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_claim_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(900));

        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET state = 'pending', worker_id = NULL, claimed_at = NULL
            WHERE state = 'claimed' AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, job: &AnalysisJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analysis_jobs (analysis_id, user_id, storage_path, analysis_type, state, attempt)
            VALUES ($1, $2, $3, $4, 'pending', 0)
            "#,
        )
        .bind(*job.analysis_id)
        .bind(*job.user_id)
        .bind(&job.storage_path)
        .bind(job.analysis_type.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self, limit: usize, worker: WorkerId) -> Result<Vec<DeliveredJob>> {
        let unclaimed = self.unclaim_stale().await?;
        if unclaimed > 0 {
            tracing::info!(unclaimed, "returned stale claims to pending");
        }

        let now = Utc::now();
        let rows = sqlx::query(
            r#"
            WITH to_claim AS (
                SELECT analysis_id
                FROM analysis_jobs
                WHERE state = 'pending'
                    AND (not_before IS NULL OR not_before <= $2)
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT $3
            )
            UPDATE analysis_jobs
            SET state = 'claimed', worker_id = $1, claimed_at = $2
            FROM to_claim
            WHERE analysis_jobs.analysis_id = to_claim.analysis_id
            RETURNING analysis_jobs.analysis_id, analysis_jobs.user_id,
                      analysis_jobs.storage_path, analysis_jobs.analysis_type,
                      analysis_jobs.attempt
            "#,
        )
        .bind(*worker)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DeliveredJob {
                job: AnalysisJob {
                    analysis_id: AnalysisId::from(row.get::<Uuid, _>("analysis_id")),
                    user_id: UserId::from(row.get::<Uuid, _>("user_id")),
                    storage_path: row.get("storage_path"),
                    analysis_type: Tier::parse_or_default(row.get::<&str, _>("analysis_type")),
                },
                attempt: row.get::<i32, _>("attempt") as u32,
            })
            .collect())
    }

    async fn ack(&self, id: AnalysisId) -> Result<()> {
        let result = sqlx::query("DELETE FROM analysis_jobs WHERE analysis_id = $1")
            .bind(*id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("claimed job"));
        }
        Ok(())
    }

    async fn retry(
        &self,
        id: AnalysisId,
        next_attempt: u32,
        not_before: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET state = 'pending', attempt = $2, not_before = $3,
                worker_id = NULL, claimed_at = NULL
            WHERE analysis_id = $1 AND state = 'claimed'
            "#,
        )
        .bind(*id)
        .bind(next_attempt as i32)
        .bind(not_before)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("claimed job"));
        }
        Ok(())
    }

    async fn dead_letter(&self, id: AnalysisId) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_jobs
            SET state = 'dead', worker_id = NULL
            WHERE analysis_id = $1 AND state != 'dead'
            "#,
        )
        .bind(*id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("claimed job"));
        }
        Ok(())
    }
}
