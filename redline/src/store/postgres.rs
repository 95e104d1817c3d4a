//! Postgres analysis store.
//!
//! Admission runs in a transaction with the balance row locked, so
//! concurrent submissions from one user serialize on the debit. Terminal
//! writes guard on `status NOT IN ('completed','failed')`; a zero-row update
//! means another delivery already finished the record, and the existing row
//! is returned unchanged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{AnalysisStore, CreateAnalysisRequest};
use crate::debug_gate;
use crate::errors::{Error, Result};
use crate::tiers::{TierConfigSnapshot, TierConfigSource};
use crate::types::{
    AnalysisId, AnalysisRecord, AnalysisStatus, RequestContext, RiskLevel, Tier, UserId,
};

pub struct PgAnalysisStore {
    pool: PgPool,
}

const RECORD_COLUMNS: &str =
    "id, user_id, contract_name, storage_path, status, risk_level, summary, \
     error_message, analysis_type, credits_used, created_at, updated_at";

fn record_from_row(row: &PgRow) -> Result<AnalysisRecord> {
    let status_raw: String = row.get("status");
    let status = AnalysisStatus::parse(&status_raw)
        .ok_or_else(|| Error::configuration(format!("unknown analysis status {status_raw:?}")))?;
    let risk_raw: Option<String> = row.get("risk_level");
    let risk_level = risk_raw.as_deref().and_then(RiskLevel::parse);

    Ok(AnalysisRecord {
        id: AnalysisId::from(row.get::<Uuid, _>("id")),
        user_id: UserId::from(row.get::<Uuid, _>("user_id")),
        contract_name: row.get("contract_name"),
        storage_path: row.get("storage_path"),
        status,
        risk_level,
        summary: row.get::<Option<Value>, _>("summary"),
        error_message: row.get("error_message"),
        analysis_type: Tier::parse_or_default(row.get::<&str, _>("analysis_type")),
        credits_used: row.get("credits_used"),
        created_at: row.get::<DateTime<Utc>, _>("created_at"),
        updated_at: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

impl PgAnalysisStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_record(&self, id: AnalysisId) -> Result<AnalysisRecord> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM analyses WHERE id = $1"
        ))
        .bind(*id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found("analysis"))?;
        record_from_row(&row)
    }
}

#[async_trait]
impl AnalysisStore for PgAnalysisStore {
    async fn create_pending(&self, request: &CreateAnalysisRequest) -> Result<AnalysisRecord> {
        let mut tx = self.pool.begin().await?;

        let balance: i64 = sqlx::query_scalar(
            "SELECT credits FROM users WHERE id = $1 FOR UPDATE",
        )
        .bind(*request.user_id)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        if balance < request.credit_cost {
            return Err(Error::PaymentRequired {
                required: request.credit_cost,
                balance,
            });
        }

        sqlx::query("UPDATE users SET credits = credits - $2 WHERE id = $1")
            .bind(*request.user_id)
            .bind(request.credit_cost)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO analyses
                (id, user_id, contract_name, storage_path, status, analysis_type, credits_used)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(*request.user_id)
        .bind(&request.contract_name)
        .bind(&request.storage_path)
        .bind(request.analysis_type.as_str())
        .bind(request.credit_cost)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        record_from_row(&row)
    }

    async fn mark_processing(&self, id: AnalysisId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE analyses
            SET status = 'processing', updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(*id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        // Distinguish "already terminal" from "no such record".
        self.fetch_record(id).await?;
        Ok(false)
    }

    async fn complete(
        &self,
        id: AnalysisId,
        summary: Value,
        risk_level: RiskLevel,
    ) -> Result<AnalysisRecord> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE analyses
            SET status = 'completed', risk_level = $2, summary = $3,
                error_message = NULL, updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(*id)
        .bind(risk_level.as_str())
        .bind(&summary)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => self.fetch_record(id).await,
        }
    }

    async fn fail(
        &self,
        id: AnalysisId,
        user_message: &str,
        debug: Option<Value>,
    ) -> Result<AnalysisRecord> {
        let summary = debug.map(|d| serde_json::json!({ "_debug": d }));
        let row = sqlx::query(&format!(
            r#"
            UPDATE analyses
            SET status = 'failed', error_message = $2, summary = $3, updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(*id)
        .bind(user_message)
        .bind(&summary)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => record_from_row(&row),
            None => self.fetch_record(id).await,
        }
    }

    async fn get(&self, id: AnalysisId, ctx: &RequestContext) -> Result<AnalysisRecord> {
        let mut record = self.fetch_record(id).await?;
        if !ctx.privileged && record.user_id != ctx.user_id {
            return Err(Error::not_found("analysis"));
        }
        debug_gate::sanitize_record(&mut record, ctx);
        Ok(record)
    }

    async fn list(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<AnalysisRecord>> {
        let rows = if ctx.privileged {
            sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM analyses ORDER BY created_at DESC LIMIT $1"
            ))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query(&format!(
                "SELECT {RECORD_COLUMNS} FROM analyses WHERE user_id = $1 \
                 ORDER BY created_at DESC LIMIT $2"
            ))
            .bind(*ctx.user_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?
        };

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = record_from_row(row)?;
            debug_gate::sanitize_record(&mut record, ctx);
            records.push(record);
        }
        Ok(records)
    }

    async fn balance(&self, user_id: UserId) -> Result<i64> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT credits FROM users WHERE id = $1")
                .bind(*user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(0))
    }

    async fn grant_credits(&self, user_id: UserId, amount: i64) -> Result<i64> {
        let balance: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO users (id, credits) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET credits = users.credits + $2
            RETURNING credits
            "#,
        )
        .bind(*user_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }
}

/// Tier configuration read from the `configurations` table, one JSON value
/// under the `tier_settings` key.
pub struct PgTierConfigSource {
    pool: PgPool,
}

impl PgTierConfigSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TierConfigSource for PgTierConfigSource {
    async fn fetch(&self) -> Result<TierConfigSnapshot> {
        let value: Option<Value> = sqlx::query_scalar(
            "SELECT value FROM configurations WHERE key = 'tier_settings'",
        )
        .fetch_optional(&self.pool)
        .await?;

        match value {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                Error::configuration(format!("stored tier configuration is invalid: {e}"))
            }),
            None => {
                tracing::info!("no stored tier configuration, using defaults");
                Ok(TierConfigSnapshot::default())
            }
        }
    }
}
