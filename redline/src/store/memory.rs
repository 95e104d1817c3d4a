//! In-memory analysis store with the same invariants as the Postgres
//! implementation. A single lock over balances and records makes the
//! debit-plus-insert admission trivially atomic.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

use super::{AnalysisStore, CreateAnalysisRequest};
use crate::debug_gate;
use crate::errors::{Error, Result};
use crate::types::{
    AnalysisId, AnalysisRecord, AnalysisStatus, RequestContext, RiskLevel, UserId,
};

#[derive(Default)]
struct Inner {
    balances: HashMap<UserId, i64>,
    records: HashMap<AnalysisId, AnalysisRecord>,
}

#[derive(Default)]
pub struct MemoryAnalysisStore {
    inner: Mutex<Inner>,
}

impl MemoryAnalysisStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a balance directly. Test convenience.
    pub fn set_balance(&self, user_id: UserId, credits: i64) {
        self.inner.lock().balances.insert(user_id, credits);
    }

    fn visible(record: &AnalysisRecord, ctx: &RequestContext) -> bool {
        ctx.privileged || record.user_id == ctx.user_id
    }
}

#[async_trait]
impl AnalysisStore for MemoryAnalysisStore {
    async fn create_pending(&self, request: &CreateAnalysisRequest) -> Result<AnalysisRecord> {
        let mut inner = self.inner.lock();
        let balance = inner.balances.get(&request.user_id).copied().unwrap_or(0);
        if balance < request.credit_cost {
            return Err(Error::PaymentRequired {
                required: request.credit_cost,
                balance,
            });
        }
        inner
            .balances
            .insert(request.user_id, balance - request.credit_cost);

        let now = Utc::now();
        let record = AnalysisRecord {
            id: AnalysisId::new(),
            user_id: request.user_id,
            contract_name: request.contract_name.clone(),
            storage_path: request.storage_path.clone(),
            status: AnalysisStatus::Pending,
            risk_level: None,
            summary: None,
            error_message: None,
            analysis_type: request.analysis_type,
            credits_used: request.credit_cost,
            created_at: now,
            updated_at: now,
        };
        inner.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn mark_processing(&self, id: AnalysisId) -> Result<bool> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("analysis"))?;
        if record.status.is_terminal() {
            return Ok(false);
        }
        record.status = AnalysisStatus::Processing;
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn complete(
        &self,
        id: AnalysisId,
        summary: Value,
        risk_level: RiskLevel,
    ) -> Result<AnalysisRecord> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("analysis"))?;
        if record.status.is_terminal() {
            return Ok(record.clone());
        }
        record.status = AnalysisStatus::Completed;
        record.risk_level = Some(risk_level);
        record.summary = Some(summary);
        record.error_message = None;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn fail(
        &self,
        id: AnalysisId,
        user_message: &str,
        debug: Option<Value>,
    ) -> Result<AnalysisRecord> {
        let mut inner = self.inner.lock();
        let record = inner
            .records
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("analysis"))?;
        if record.status.is_terminal() {
            return Ok(record.clone());
        }
        record.status = AnalysisStatus::Failed;
        record.error_message = Some(user_message.to_string());
        record.summary = debug.map(|d| serde_json::json!({ "_debug": d }));
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn get(&self, id: AnalysisId, ctx: &RequestContext) -> Result<AnalysisRecord> {
        let inner = self.inner.lock();
        let record = inner
            .records
            .get(&id)
            .filter(|r| Self::visible(r, ctx))
            .ok_or_else(|| Error::not_found("analysis"))?;
        let mut record = record.clone();
        debug_gate::sanitize_record(&mut record, ctx);
        Ok(record)
    }

    async fn list(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<AnalysisRecord>> {
        let inner = self.inner.lock();
        let mut records: Vec<AnalysisRecord> = inner
            .records
            .values()
            .filter(|r| Self::visible(r, ctx))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        for record in &mut records {
            debug_gate::sanitize_record(record, ctx);
        }
        Ok(records)
    }

    async fn balance(&self, user_id: UserId) -> Result<i64> {
        Ok(self.inner.lock().balances.get(&user_id).copied().unwrap_or(0))
    }

    async fn grant_credits(&self, user_id: UserId, amount: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        let balance = inner.balances.entry(user_id).or_insert(0);
        *balance += amount;
        Ok(*balance)
    }
}
