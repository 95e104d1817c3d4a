//! Worker pool: claims jobs, runs the analysis pipeline, and routes attempt
//! outcomes through the retry policy.
//!
//! Each worker task claims one job at a time, so the pool's concurrency
//! bound is exactly `WorkerSettings::concurrency`. A whole-attempt timeout
//! sits above the provider timeout, guaranteeing a worker slot is always
//! reclaimed even if the pipeline wedges.

use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::config::WorkerSettings;
use crate::documents::{DocumentStore, TextExtractor};
use crate::errors::{Error, Result};
use crate::model::{self, ModelClient};
use crate::preprocess;
use crate::queue::{AttemptOutcome, DeliveredJob, JobQueue, QueuePolicy};
use crate::store::AnalysisStore;
use crate::tiers::TierResolver;
use crate::types::{RiskLevel, WorkerId};

pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn AnalysisStore>,
    documents: Arc<dyn DocumentStore>,
    extractor: Arc<dyn TextExtractor>,
    model: Arc<dyn ModelClient>,
    tiers: Arc<TierResolver>,
    policy: QueuePolicy,
    settings: WorkerSettings,
    jobs_in_flight: AtomicUsize,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn AnalysisStore>,
        documents: Arc<dyn DocumentStore>,
        extractor: Arc<dyn TextExtractor>,
        model: Arc<dyn ModelClient>,
        tiers: Arc<TierResolver>,
        policy: QueuePolicy,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            store,
            documents,
            extractor,
            model,
            tiers,
            policy,
            settings,
            jobs_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn jobs_in_flight(&self) -> usize {
        self.jobs_in_flight.load(Ordering::SeqCst)
    }

    /// Spawn the worker tasks. Aborting the returned handles stops the pool.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.settings.concurrency)
            .map(|i| {
                let pool = Arc::clone(self);
                tokio::spawn(async move {
                    let worker = WorkerId::new();
                    tracing::info!(worker = %worker, index = i, "worker started");
                    pool.worker_loop(worker).await;
                })
            })
            .collect()
    }

    async fn worker_loop(&self, worker: WorkerId) {
        loop {
            let delivered = match self.queue.claim(1, worker).await {
                Ok(delivered) => delivered,
                Err(e) => {
                    tracing::error!(worker = %worker, error = %e, "claim failed");
                    tokio::time::sleep(self.settings.claim_interval).await;
                    continue;
                }
            };

            if delivered.is_empty() {
                tokio::time::sleep(self.settings.claim_interval).await;
                continue;
            }

            for delivery in delivered {
                self.handle_delivery(delivery).await;
            }
        }
    }

    /// Run one attempt and route its outcome. Never returns an error; every
    /// failure path ends in a queue transition.
    pub async fn handle_delivery(&self, delivery: DeliveredJob) {
        self.jobs_in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = scopeguard::guard((), |_| {
            self.jobs_in_flight.fetch_sub(1, Ordering::SeqCst);
        });

        let id = delivery.job.analysis_id;
        let tier = delivery.job.analysis_type;
        tracing::info!(
            analysis_id = %id,
            tier = %tier,
            attempt = delivery.attempt,
            "processing analysis"
        );

        let outcome =
            match tokio::time::timeout(tier.job_timeout(), self.try_process(&delivery)).await {
                Ok(Ok(())) => AttemptOutcome::Succeeded,
                Ok(Err(e)) if e.is_permanent() => AttemptOutcome::PermanentFailure(e),
                Ok(Err(e)) => AttemptOutcome::RetryableFailure(e),
                Err(_) => AttemptOutcome::RetryableFailure(Error::timeout(format!(
                    "analysis attempt exceeded the {:?} job timeout",
                    tier.job_timeout()
                ))),
            };

        match outcome {
            AttemptOutcome::Succeeded => {
                if let Err(e) = self.queue.ack(id).await {
                    tracing::error!(analysis_id = %id, error = %e, "ack failed");
                }
            }
            AttemptOutcome::PermanentFailure(e) => {
                tracing::warn!(analysis_id = %id, error = %e, "permanent failure, dead-lettering");
                self.finalize_failure(&delivery, &e).await;
            }
            AttemptOutcome::RetryableFailure(e) => {
                let next_attempt = delivery.attempt + 1;
                if self.policy.should_dead_letter(next_attempt) {
                    tracing::warn!(
                        analysis_id = %id,
                        attempts = next_attempt,
                        error = %e,
                        "attempt budget exhausted, dead-lettering"
                    );
                    self.finalize_failure(&delivery, &e).await;
                } else {
                    let delay = self.policy.next_delay(delivery.attempt);
                    tracing::info!(
                        analysis_id = %id,
                        next_attempt,
                        delay = ?delay,
                        error = %e,
                        "retrying after backoff"
                    );
                    let not_before = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300));
                    if let Err(e) = self.queue.retry(id, next_attempt, not_before).await {
                        tracing::error!(analysis_id = %id, error = %e, "retry transition failed");
                    }
                }
            }
        }
    }

    /// Terminal failure: record first, then dead-letter. The record write is
    /// idempotent, so a crash between the two steps is safe to redo.
    async fn finalize_failure(&self, delivery: &DeliveredJob, error: &Error) {
        let id = delivery.job.analysis_id;
        if let Err(e) = self
            .store
            .fail(id, &error.user_message(), error.debug_payload())
            .await
        {
            tracing::error!(analysis_id = %id, error = %e, "failed to record terminal failure");
        }
        if let Err(e) = self.queue.dead_letter(id).await {
            tracing::error!(analysis_id = %id, error = %e, "dead-letter transition failed");
        }
    }

    /// The analysis pipeline for one attempt.
    async fn try_process(&self, delivery: &DeliveredJob) -> Result<()> {
        let job = &delivery.job;

        // A false return means another delivery already finished this
        // record; drop the duplicate without touching anything.
        if !self.store.mark_processing(job.analysis_id).await? {
            tracing::info!(analysis_id = %job.analysis_id, "record already terminal, dropping duplicate delivery");
            return Ok(());
        }

        let bytes = self.documents.download(&job.storage_path).await?;
        let text = self.extractor.extract(&bytes)?;
        if text.trim().is_empty() {
            return Err(Error::EmptyDocument);
        }

        let resolved = self.tiers.resolve(job.analysis_type).await?;
        let budget = resolved.document_budget();

        let (document_text, reduction) = if self.tiers.preprocessing_enabled().await {
            let result = preprocess::preprocess_document(&text, budget);
            let meta = if result.was_reduced {
                Some(serde_json::json!({
                    "original_token_count": result.original_token_count,
                    "processed_token_count": result.processed_token_count,
                    "units_total": result.units_total,
                    "units_kept": result.units_kept,
                    "categories": result.categories,
                }))
            } else {
                None
            };
            (result.text, meta)
        } else {
            (preprocess::truncate_to_tokens(&text, budget), None)
        };

        let mut summary = model::analyze(self.model.as_ref(), &resolved, &document_text).await?;

        if let (Some(meta), Some(debug)) = (
            reduction,
            summary.get_mut("_debug").and_then(Value::as_object_mut),
        ) {
            debug.insert("preprocessing".into(), meta);
        }

        let risk_level = summary
            .get("risk_level")
            .or_else(|| summary.get("nivel_riesgo_general"))
            .or_else(|| summary.get("nivel_riesgo"))
            .and_then(Value::as_str)
            .map(RiskLevel::from_provider_label)
            .unwrap_or_else(|| {
                tracing::warn!(
                    analysis_id = %job.analysis_id,
                    "summary carries no risk label, defaulting to medium"
                );
                RiskLevel::Medium
            });

        self.store
            .complete(job.analysis_id, summary, risk_level)
            .await?;
        tracing::info!(analysis_id = %job.analysis_id, risk = %risk_level, "analysis completed");
        Ok(())
    }
}
