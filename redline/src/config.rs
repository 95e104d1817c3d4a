//! Application configuration management.
//!
//! Configuration is loaded from a YAML file with environment variable
//! overrides. The file path defaults to `config.yaml` but can be specified
//! via `-f` flag or `REDLINE_CONFIG`. Variables prefixed with `REDLINE_`
//! override YAML values; nested fields use double underscores, e.g.
//! `REDLINE_WORKER__CONCURRENCY=4`.

use clap::Parser;
use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::queue::QueuePolicy;

/// Simple CLI args - just for specifying the config file.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short = 'f', long, env = "REDLINE_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Validate configuration and exit without starting the workers.
    #[arg(long)]
    pub validate: bool,
}

/// Main application configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// PostgreSQL connection settings for records, jobs, and tier config.
    pub database: DatabaseConfig,
    /// OpenAI-compatible model provider settings.
    pub model_provider: ModelProviderConfig,
    /// Queue retry/backoff policy.
    pub queue: QueuePolicy,
    /// Worker pool settings.
    pub worker: WorkerSettings,
    /// TTL for the cached tier configuration snapshot.
    #[serde(with = "humantime_serde")]
    pub tier_cache_ttl: Duration,
    /// Rate limiting settings.
    pub limits: LimitsConfig,
    /// Document store settings.
    pub documents: DocumentsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            model_provider: ModelProviderConfig::default(),
            queue: QueuePolicy::default(),
            worker: WorkerSettings::default(),
            tier_cache_ttl: Duration::from_secs(60),
            limits: LimitsConfig::default(),
            documents: DocumentsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from the YAML file named by `args`, with
    /// `REDLINE_`-prefixed environment overrides merged on top.
    pub fn load(args: &Args) -> Result<Config> {
        let figment = Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("REDLINE_").split("__"));

        let mut config: Config = figment
            .extract()
            .map_err(|e| Error::configuration(format!("failed to load configuration: {e}")))?;

        // DATABASE_URL wins over anything in the file, matching common
        // deployment conventions.
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = Some(url);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_attempts == 0 {
            return Err(Error::configuration("queue.max_attempts must be at least 1"));
        }
        if self.worker.concurrency == 0 {
            return Err(Error::configuration("worker.concurrency must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL. May also be supplied via `DATABASE_URL`.
    pub url: Option<String>,
    /// Maximum number of pooled connections.
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelProviderConfig {
    /// Base URL of the OpenAI-compatible chat completions API.
    pub base_url: String,
    /// Provider API key. May also be supplied via `REDLINE_MODEL_PROVIDER__API_KEY`.
    pub api_key: Option<String>,
}

impl Default for ModelProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerSettings {
    /// Number of concurrent consumers. Each job performs one expensive,
    /// rate-limited model call, so this stays small.
    pub concurrency: usize,
    /// How long an idle worker sleeps between claim attempts.
    #[serde(with = "humantime_serde")]
    pub claim_interval: Duration,
    /// Claims older than this are returned to pending (worker crash recovery).
    #[serde(with = "humantime_serde")]
    pub stale_claim_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            claim_interval: Duration::from_secs(1),
            stale_claim_timeout: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsConfig {
    /// Disable to skip rate-limit checks entirely (tests, local dev).
    pub enabled: bool,
    /// Redis URL for the distributed window counter. When unset or
    /// unreachable, an in-process counter with identical window semantics
    /// is used instead.
    pub redis_url: Option<String>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            redis_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DocumentsConfig {
    /// Root directory of the filesystem-backed document store.
    pub root: PathBuf,
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./contracts"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker.concurrency, 2);
        assert_eq!(config.queue.max_attempts, 3);
        assert_eq!(config.queue.base_delay, Duration::from_millis(5000));
        assert_eq!(config.tier_cache_ttl, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_attempts_rejected() {
        let mut config = Config::default();
        config.queue.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
