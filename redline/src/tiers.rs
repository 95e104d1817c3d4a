//! Tier configuration: model whitelist, per-tier settings, and a TTL cache
//! over the stored configuration.
//!
//! The resolver is the only way to obtain a [`ResolvedTier`], so any model
//! name reaching the provider client has already passed the whitelist.

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::errors::{Error, Result};
use crate::prompts;
use crate::types::Tier;

/// Closed set of model identifiers the pipeline may invoke. Tier
/// configuration naming anything else is rejected at resolution time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowedModel {
    Gpt4oMini,
    Gpt4o,
    Gpt5Mini,
    Gpt5,
    O1Mini,
    O1,
    O3Mini,
}

impl AllowedModel {
    pub fn parse(name: &str) -> Option<AllowedModel> {
        match name {
            "gpt-4o-mini" => Some(AllowedModel::Gpt4oMini),
            "gpt-4o" => Some(AllowedModel::Gpt4o),
            "gpt-5-mini" => Some(AllowedModel::Gpt5Mini),
            "gpt-5" => Some(AllowedModel::Gpt5),
            "o1-mini" => Some(AllowedModel::O1Mini),
            "o1" => Some(AllowedModel::O1),
            "o3-mini" => Some(AllowedModel::O3Mini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AllowedModel::Gpt4oMini => "gpt-4o-mini",
            AllowedModel::Gpt4o => "gpt-4o",
            AllowedModel::Gpt5Mini => "gpt-5-mini",
            AllowedModel::Gpt5 => "gpt-5",
            AllowedModel::O1Mini => "o1-mini",
            AllowedModel::O1 => "o1",
            AllowedModel::O3Mini => "o3-mini",
        }
    }

    /// Reasoning models take different request parameters: they reject a
    /// custom temperature and use `max_completion_tokens`.
    pub fn is_reasoning(&self) -> bool {
        matches!(
            self,
            AllowedModel::Gpt5Mini
                | AllowedModel::Gpt5
                | AllowedModel::O1Mini
                | AllowedModel::O1
                | AllowedModel::O3Mini
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokenLimits {
    /// Budget for document text, before the prompt scaffold reservation.
    pub input: usize,
    /// Cap on generated tokens.
    pub output: usize,
}

/// Stored per-tier settings. `model` stays a string here because the store
/// holds whatever an operator wrote; the whitelist check happens in
/// [`TierResolver::resolve`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierSettings {
    pub model: String,
    pub credit_cost: i64,
    pub token_limits: TokenLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureFlags {
    /// When off, oversized documents are hard-truncated instead of
    /// relevance-filtered.
    pub preprocessing_enabled: bool,
    /// Development escape hatch: expose `_debug` metadata to all callers.
    pub debug_visible: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            preprocessing_enabled: true,
            debug_visible: false,
        }
    }
}

/// One immutable snapshot of the full tier configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierConfigSnapshot {
    pub tiers: HashMap<String, TierSettings>,
    pub features: FeatureFlags,
    /// Prompt set version recorded on results for traceability.
    pub prompt_version: String,
}

impl Default for TierConfigSnapshot {
    fn default() -> Self {
        let mut tiers = HashMap::new();
        tiers.insert(
            "basic".to_string(),
            TierSettings {
                model: "gpt-4o-mini".to_string(),
                credit_cost: 1,
                token_limits: TokenLimits {
                    input: 8000,
                    output: 2500,
                },
            },
        );
        tiers.insert(
            "premium".to_string(),
            TierSettings {
                model: "gpt-5".to_string(),
                credit_cost: 2,
                token_limits: TokenLimits {
                    input: 35000,
                    output: 10000,
                },
            },
        );
        tiers.insert(
            "forensic".to_string(),
            TierSettings {
                model: "gpt-5".to_string(),
                credit_cost: 5,
                token_limits: TokenLimits {
                    input: 120_000,
                    output: 30_000,
                },
            },
        );
        Self {
            tiers,
            features: FeatureFlags::default(),
            prompt_version: prompts::PROMPT_VERSION.to_string(),
        }
    }
}

impl TierConfigSnapshot {
    /// Settings for a tier, falling back to the premium defaults when the
    /// snapshot lacks the key. The fallback keeps a half-migrated stored
    /// configuration from taking the pipeline down.
    pub fn settings_for(&self, tier: Tier) -> TierSettings {
        if let Some(settings) = self.tiers.get(tier.as_str()) {
            return settings.clone();
        }
        tracing::warn!(tier = %tier, "tier missing from stored configuration, using defaults");
        let defaults = TierConfigSnapshot::default();
        defaults
            .tiers
            .get(tier.as_str())
            .or_else(|| defaults.tiers.get("premium"))
            .cloned()
            .unwrap_or(TierSettings {
                model: "gpt-5".to_string(),
                credit_cost: 2,
                token_limits: TokenLimits {
                    input: 35000,
                    output: 10000,
                },
            })
    }
}

/// Where tier configuration comes from. Production uses the database-backed
/// source; tests use [`StaticConfigSource`].
#[async_trait]
pub trait TierConfigSource: Send + Sync {
    async fn fetch(&self) -> Result<TierConfigSnapshot>;
}

/// Fixed snapshot source for tests and bootstrap.
pub struct StaticConfigSource {
    snapshot: TierConfigSnapshot,
}

impl StaticConfigSource {
    pub fn new(snapshot: TierConfigSnapshot) -> Self {
        Self { snapshot }
    }
}

impl Default for StaticConfigSource {
    fn default() -> Self {
        Self::new(TierConfigSnapshot::default())
    }
}

#[async_trait]
impl TierConfigSource for StaticConfigSource {
    async fn fetch(&self) -> Result<TierConfigSnapshot> {
        Ok(self.snapshot.clone())
    }
}

/// A tier whose model has passed the whitelist. Fields are private so the
/// only constructor is [`TierResolver::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedTier {
    tier: Tier,
    model: AllowedModel,
    credit_cost: i64,
    token_limits: TokenLimits,
    prompt_version: String,
}

impl ResolvedTier {
    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn model(&self) -> AllowedModel {
        self.model
    }

    pub fn credit_cost(&self) -> i64 {
        self.credit_cost
    }

    pub fn token_limits(&self) -> TokenLimits {
        self.token_limits
    }

    pub fn prompt_version(&self) -> &str {
        &self.prompt_version
    }

    /// Token budget left for document text after the prompt scaffold
    /// reservation.
    pub fn document_budget(&self) -> usize {
        self.token_limits
            .input
            .saturating_sub(self.tier.reserved_prompt_buffer())
    }
}

struct CachedSnapshot {
    snapshot: Arc<TierConfigSnapshot>,
    fetched_at: Instant,
}

/// TTL-cached view over a [`TierConfigSource`].
///
/// A fetch failure with a warm (even expired) cache serves the stale
/// snapshot; with a cold cache it falls back to compiled-in defaults. Either
/// way resolution never fails on source unavailability, only on whitelist
/// violations.
pub struct TierResolver {
    source: Arc<dyn TierConfigSource>,
    ttl: Duration,
    cache: ArcSwapOption<CachedSnapshot>,
}

impl TierResolver {
    pub fn new(source: Arc<dyn TierConfigSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            cache: ArcSwapOption::const_empty(),
        }
    }

    /// Current configuration snapshot, fetched through the TTL cache.
    pub async fn snapshot(&self) -> Arc<TierConfigSnapshot> {
        if let Some(cached) = self.cache.load_full() {
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.snapshot.clone();
            }
        }

        match self.source.fetch().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                self.cache.store(Some(Arc::new(CachedSnapshot {
                    snapshot: snapshot.clone(),
                    fetched_at: Instant::now(),
                })));
                snapshot
            }
            Err(e) => {
                if let Some(cached) = self.cache.load_full() {
                    tracing::warn!(error = %e, "tier config fetch failed, serving stale snapshot");
                    cached.snapshot.clone()
                } else {
                    tracing::warn!(error = %e, "tier config fetch failed, using defaults");
                    Arc::new(TierConfigSnapshot::default())
                }
            }
        }
    }

    /// Resolve a tier to its settings, enforcing the model whitelist.
    pub async fn resolve(&self, tier: Tier) -> Result<ResolvedTier> {
        let snapshot = self.snapshot().await;
        let settings = snapshot.settings_for(tier);

        let model = AllowedModel::parse(&settings.model).ok_or_else(|| {
            Error::configuration(format!(
                "model {:?} for tier {tier} is not on the whitelist",
                settings.model
            ))
        })?;

        Ok(ResolvedTier {
            tier,
            model,
            credit_cost: settings.credit_cost,
            token_limits: settings.token_limits,
            prompt_version: snapshot.prompt_version.clone(),
        })
    }

    /// Drop the cached snapshot so the next call refetches.
    pub fn invalidate(&self) {
        self.cache.store(None);
    }

    pub async fn debug_visible(&self) -> bool {
        self.snapshot().await.features.debug_visible
    }

    pub async fn preprocessing_enabled(&self) -> bool {
        self.snapshot().await.features.preprocessing_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        snapshot: TierConfigSnapshot,
        fetches: AtomicUsize,
    }

    impl CountingSource {
        fn new(snapshot: TierConfigSnapshot) -> Self {
            Self {
                snapshot,
                fetches: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TierConfigSource for CountingSource {
        async fn fetch(&self) -> Result<TierConfigSnapshot> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.snapshot.clone())
        }
    }

    struct FailingSource;

    #[async_trait]
    impl TierConfigSource for FailingSource {
        async fn fetch(&self) -> Result<TierConfigSnapshot> {
            Err(Error::external("config store unreachable"))
        }
    }

    #[tokio::test]
    async fn resolve_uses_stored_settings() {
        let resolver = TierResolver::new(
            Arc::new(StaticConfigSource::default()),
            Duration::from_secs(60),
        );
        let resolved = resolver.resolve(Tier::Basic).await.unwrap();
        assert_eq!(resolved.model(), AllowedModel::Gpt4oMini);
        assert_eq!(resolved.credit_cost(), 1);
        assert_eq!(resolved.token_limits().input, 8000);
        assert_eq!(resolved.document_budget(), 6000);
    }

    #[tokio::test]
    async fn forensic_reserves_larger_prompt_buffer() {
        let resolver = TierResolver::new(
            Arc::new(StaticConfigSource::default()),
            Duration::from_secs(60),
        );
        let resolved = resolver.resolve(Tier::Forensic).await.unwrap();
        assert_eq!(resolved.document_budget(), 115_000);
    }

    #[tokio::test]
    async fn unwhitelisted_model_is_rejected() {
        let mut snapshot = TierConfigSnapshot::default();
        snapshot.tiers.get_mut("basic").unwrap().model = "gpt-3.5-turbo".to_string();
        let resolver = TierResolver::new(
            Arc::new(StaticConfigSource::new(snapshot)),
            Duration::from_secs(60),
        );
        let err = resolver.resolve(Tier::Basic).await.unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[tokio::test]
    async fn snapshot_is_cached_within_ttl() {
        let source = Arc::new(CountingSource::new(TierConfigSnapshot::default()));
        let resolver = TierResolver::new(source.clone(), Duration::from_secs(60));
        resolver.snapshot().await;
        resolver.snapshot().await;
        resolver.snapshot().await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let source = Arc::new(CountingSource::new(TierConfigSnapshot::default()));
        let resolver = TierResolver::new(source.clone(), Duration::from_secs(60));
        resolver.snapshot().await;
        resolver.invalidate();
        resolver.snapshot().await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fetch_failure_with_cold_cache_uses_defaults() {
        let resolver = TierResolver::new(Arc::new(FailingSource), Duration::from_secs(60));
        let resolved = resolver.resolve(Tier::Premium).await.unwrap();
        assert_eq!(resolved.model(), AllowedModel::Gpt5);
        assert_eq!(resolved.credit_cost(), 2);
    }

    #[tokio::test]
    async fn missing_tier_key_falls_back_to_defaults() {
        let mut snapshot = TierConfigSnapshot::default();
        snapshot.tiers.remove("forensic");
        let resolver = TierResolver::new(
            Arc::new(StaticConfigSource::new(snapshot)),
            Duration::from_secs(60),
        );
        let resolved = resolver.resolve(Tier::Forensic).await.unwrap();
        assert_eq!(resolved.credit_cost(), 5);
        assert_eq!(resolved.token_limits().input, 120_000);
    }

    #[test]
    fn default_snapshot_carries_current_prompt_version() {
        assert_eq!(
            TierConfigSnapshot::default().prompt_version,
            prompts::PROMPT_VERSION
        );
    }

    #[test]
    fn reasoning_model_classification() {
        assert!(AllowedModel::Gpt5.is_reasoning());
        assert!(AllowedModel::O1Mini.is_reasoning());
        assert!(!AllowedModel::Gpt4o.is_reasoning());
        assert!(!AllowedModel::Gpt4oMini.is_reasoning());
    }

    #[test]
    fn whitelist_rejects_unknown_names() {
        assert!(AllowedModel::parse("gpt-4o").is_some());
        assert!(AllowedModel::parse("gpt-4").is_none());
        assert!(AllowedModel::parse("claude-3").is_none());
        assert!(AllowedModel::parse("").is_none());
    }
}
