//! Application facade: the operations callers invoke, wired over the store,
//! queue, limiter, and resolver.

use std::sync::Arc;

use crate::documents::{DocumentStore, TextExtractor};
use crate::errors::{Error, Result};
use crate::preprocess::{self, TokenEstimate};
use crate::queue::{AnalysisJob, JobQueue};
use crate::ratelimit::{self, RateLimiter};
use crate::store::{AnalysisStore, CreateAnalysisRequest};
use crate::tiers::TierResolver;
use crate::types::{AnalysisId, AnalysisRecord, RequestContext, Tier};

pub struct App {
    pub store: Arc<dyn AnalysisStore>,
    pub queue: Arc<dyn JobQueue>,
    pub documents: Arc<dyn DocumentStore>,
    pub extractor: Arc<dyn TextExtractor>,
    pub tiers: Arc<TierResolver>,
    pub limiter: Arc<RateLimiter>,
}

pub struct SubmitRequest {
    pub contract_name: String,
    pub storage_path: String,
    pub analysis_type: Tier,
}

impl App {
    /// Admit an analysis: rate limit, resolve the tier for its cost, debit
    /// and create the pending record, then enqueue.
    ///
    /// If the enqueue fails after admission, the record is failed so the
    /// caller is not left with a pending analysis no worker will pick up.
    pub async fn submit(
        &self,
        ctx: &RequestContext,
        request: SubmitRequest,
    ) -> Result<AnalysisRecord> {
        self.limiter
            .check(&ctx.user_id.to_string(), ratelimit::ANALYZE)
            .await?;

        // Resolve before debiting so a bad tier configuration never costs
        // the user credits.
        let resolved = self.tiers.resolve(request.analysis_type).await?;

        let record = self
            .store
            .create_pending(&CreateAnalysisRequest {
                user_id: ctx.user_id,
                contract_name: request.contract_name,
                storage_path: request.storage_path,
                analysis_type: request.analysis_type,
                credit_cost: resolved.credit_cost(),
            })
            .await?;

        let job = AnalysisJob {
            analysis_id: record.id,
            user_id: record.user_id,
            storage_path: record.storage_path.clone(),
            analysis_type: record.analysis_type,
        };
        if let Err(e) = self.queue.enqueue(&job).await {
            tracing::error!(analysis_id = %record.id, error = %e, "enqueue failed after admission");
            let failed = self
                .store
                .fail(record.id, &Error::external("enqueue failed").user_message(), None)
                .await?;
            return Ok(failed);
        }

        tracing::info!(
            analysis_id = %record.id,
            tier = %record.analysis_type,
            credits = record.credits_used,
            "analysis submitted"
        );
        Ok(record)
    }

    pub async fn get_status(
        &self,
        ctx: &RequestContext,
        id: AnalysisId,
    ) -> Result<AnalysisRecord> {
        self.limiter
            .check(&ctx.user_id.to_string(), ratelimit::STANDARD_READ)
            .await?;
        let ctx = self.read_context(ctx).await;
        self.store.get(id, &ctx).await
    }

    pub async fn list(&self, ctx: &RequestContext, limit: usize) -> Result<Vec<AnalysisRecord>> {
        self.limiter
            .check(&ctx.user_id.to_string(), ratelimit::STANDARD_READ)
            .await?;
        let ctx = self.read_context(ctx).await;
        self.store.list(&ctx, limit).await
    }

    /// Fold the `debug_visible` feature flag into the caller context so the
    /// debug gate honors stored configuration on every read path.
    async fn read_context(&self, ctx: &RequestContext) -> RequestContext {
        ctx.with_debug_enabled(ctx.debug_enabled || self.tiers.debug_visible().await)
    }

    /// Count a stored document's tokens against every tier's budget, so a
    /// caller can pick a tier before spending credits.
    pub async fn check_tokens(
        &self,
        ctx: &RequestContext,
        storage_path: &str,
    ) -> Result<TokenEstimate> {
        self.limiter
            .check(&ctx.user_id.to_string(), ratelimit::STANDARD_READ)
            .await?;
        let bytes = self.documents.download(storage_path).await?;
        let text = self.extractor.extract(&bytes)?;
        let snapshot = self.tiers.snapshot().await;
        Ok(preprocess::estimate(&text, &snapshot))
    }
}
