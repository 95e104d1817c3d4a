use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;

use redline::config::{Args, Config};
use redline::documents::{FsDocumentStore, PlainTextExtractor};
use redline::errors::Error;
use redline::model::OpenAiClient;
use redline::queue::PgJobQueue;
use redline::store::postgres::PgTierConfigSource;
use redline::store::PgAnalysisStore;
use redline::telemetry;
use redline::tiers::TierResolver;
use redline::worker::WorkerPool;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("configuration ok");
        return Ok(());
    }

    telemetry::init();
    tracing::info!(config_file = %args.config, "starting redline");

    let database_url = config
        .database
        .url
        .clone()
        .ok_or_else(|| Error::configuration("database.url is required"))?;
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect(&database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let api_key = config
        .model_provider
        .api_key
        .clone()
        .ok_or_else(|| Error::configuration("model_provider.api_key is required"))?;

    let store = Arc::new(PgAnalysisStore::new(pool.clone()));
    let queue = Arc::new(PgJobQueue::new(
        pool.clone(),
        config.worker.stale_claim_timeout,
    ));
    let documents = Arc::new(FsDocumentStore::new(config.documents.root.clone()));
    let extractor = Arc::new(PlainTextExtractor);
    let model = Arc::new(OpenAiClient::new(
        config.model_provider.base_url.clone(),
        api_key,
    ));
    let tiers = Arc::new(TierResolver::new(
        Arc::new(PgTierConfigSource::new(pool.clone())),
        config.tier_cache_ttl,
    ));

    let worker_pool = Arc::new(WorkerPool::new(
        queue,
        store,
        documents,
        extractor,
        model,
        tiers,
        config.queue.clone(),
        config.worker.clone(),
    ));
    let handles = worker_pool.start();
    tracing::info!(workers = handles.len(), "worker pool running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    for handle in handles {
        handle.abort();
    }
    Ok(())
}
