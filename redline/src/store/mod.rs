//! Analysis record store: credit accounting and the forward-only status
//! machine.
//!
//! Two invariants live here. Admission is atomic: the credit debit and the
//! pending record are created together or not at all, so a user is never
//! charged without a record nor given a free analysis. Terminal writes are
//! idempotent: the first `complete` or `fail` wins and later ones return the
//! existing record unchanged, which is what lets the queue deliver
//! at-least-once safely.

use async_trait::async_trait;

use crate::errors::Result;
use crate::types::{AnalysisId, AnalysisRecord, RequestContext, RiskLevel, Tier, UserId};

pub mod memory;
pub mod postgres;

pub use memory::MemoryAnalysisStore;
pub use postgres::PgAnalysisStore;

#[derive(Debug, Clone)]
pub struct CreateAnalysisRequest {
    pub user_id: UserId,
    pub contract_name: String,
    pub storage_path: String,
    pub analysis_type: Tier,
    pub credit_cost: i64,
}

#[async_trait]
pub trait AnalysisStore: Send + Sync {
    /// Atomically debit the credit cost and create a pending record.
    /// Fails with `PaymentRequired` when the balance is insufficient, in
    /// which case nothing is debited.
    async fn create_pending(&self, request: &CreateAnalysisRequest) -> Result<AnalysisRecord>;

    /// Move a pending record to processing. Returns `false` when the record
    /// is already terminal, which tells a worker this delivery is a
    /// duplicate and must be dropped.
    async fn mark_processing(&self, id: AnalysisId) -> Result<bool>;

    /// Terminal success write. Idempotent: if the record is already
    /// terminal, returns it unchanged.
    async fn complete(
        &self,
        id: AnalysisId,
        summary: serde_json::Value,
        risk_level: RiskLevel,
    ) -> Result<AnalysisRecord>;

    /// Terminal failure write. Idempotent like [`complete`]. `debug` is
    /// stored under the summary's `_debug` key for privileged inspection.
    ///
    /// [`complete`]: AnalysisStore::complete
    async fn fail(
        &self,
        id: AnalysisId,
        user_message: &str,
        debug: Option<serde_json::Value>,
    ) -> Result<AnalysisRecord>;

    /// Fetch one record, applying ownership and the debug gate. Privileged
    /// callers see any record; others see only their own, and a foreign id
    /// reads as `NotFound` rather than `Authorization` to avoid confirming
    /// the record exists.
    async fn get(&self, id: AnalysisId, ctx: &RequestContext) -> Result<AnalysisRecord>;

    /// Most recent records visible to the caller, newest first.
    async fn list(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<AnalysisRecord>>;

    /// Current credit balance. Unknown users read as zero.
    async fn balance(&self, user_id: UserId) -> Result<i64>;

    /// Add credits to a user's balance, creating the account if needed.
    async fn grant_credits(&self, user_id: UserId, amount: i64) -> Result<i64>;
}
