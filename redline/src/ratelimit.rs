//! Fixed-window rate limiting with a distributed primary counter and an
//! in-process fallback.
//!
//! Windows are aligned to the epoch: key index = now_ms / window_ms, so all
//! processes sharing the Redis counter agree on window boundaries. When the
//! primary store errors, the check falls back to the in-process counter
//! rather than failing open or closed on its own.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::errors::{Error, Result};

/// A named limit: at most `max_requests` per `window` per subject.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitPreset {
    pub name: &'static str,
    pub window: Duration,
    pub max_requests: u64,
}

/// Analysis submission. The most expensive operation gets the tightest cap.
pub const ANALYZE: RateLimitPreset = RateLimitPreset {
    name: "analyze",
    window: Duration::from_secs(60),
    max_requests: 3,
};

pub const UPLOAD: RateLimitPreset = RateLimitPreset {
    name: "upload",
    window: Duration::from_secs(60),
    max_requests: 5,
};

pub const STANDARD_READ: RateLimitPreset = RateLimitPreset {
    name: "standard-read",
    window: Duration::from_secs(60),
    max_requests: 30,
};

pub const AUTH: RateLimitPreset = RateLimitPreset {
    name: "auth",
    window: Duration::from_secs(900),
    max_requests: 10,
};

pub const PAYMENT: RateLimitPreset = RateLimitPreset {
    name: "payment",
    window: Duration::from_secs(60),
    max_requests: 5,
};

/// Backing counter. `incr` returns the post-increment count for the key,
/// creating it with the given expiry when absent.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn incr(&self, key: &str, expiry: Duration) -> Result<u64>;
}

/// In-process counter used as the fallback (and for tests / single-node
/// deployments). Expired entries are pruned lazily.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, (u64, SystemTime)>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr(&self, key: &str, expiry: Duration) -> Result<u64> {
        let now = SystemTime::now();
        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert((0, now + expiry));
        if entry.1 <= now {
            *entry = (0, now + expiry);
        }
        entry.0 += 1;
        let count = entry.0;
        drop(entry);

        if self.counters.len() > 10_000 {
            self.counters.retain(|_, (_, deadline)| *deadline > now);
        }
        Ok(count)
    }
}

/// Redis-backed counter shared across processes.
pub struct RedisCounterStore {
    client: redis::Client,
}

impl RedisCounterStore {
    pub fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| Error::configuration(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn incr(&self, key: &str, expiry: Duration) -> Result<u64> {
        let mut conn = self
            .client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| Error::external(format!("redis connect failed: {e}")))?;

        let count: u64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::external(format!("redis INCR failed: {e}")))?;

        // First hit in the window owns the expiry. Window keys are
        // epoch-aligned so a lost PEXPIRE only leaks one key.
        if count == 1 {
            let _: () = redis::cmd("PEXPIRE")
                .arg(key)
                .arg(expiry.as_millis() as u64)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::external(format!("redis PEXPIRE failed: {e}")))?;
        }

        Ok(count)
    }
}

pub struct RateLimiter {
    primary: Option<Arc<dyn CounterStore>>,
    fallback: Arc<dyn CounterStore>,
    enabled: bool,
}

impl RateLimiter {
    pub fn new(primary: Option<Arc<dyn CounterStore>>) -> Self {
        Self {
            primary,
            fallback: Arc::new(MemoryCounterStore::new()),
            enabled: true,
        }
    }

    /// A limiter that admits everything. For tests and local development.
    pub fn disabled() -> Self {
        Self {
            primary: None,
            fallback: Arc::new(MemoryCounterStore::new()),
            enabled: false,
        }
    }

    /// Check `subject` against `preset`, consuming one unit of the window.
    ///
    /// Returns `Error::RateLimit` with the time remaining in the current
    /// window when the cap is exceeded.
    pub async fn check(&self, subject: &str, preset: RateLimitPreset) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let window_ms = preset.window.as_millis() as u64;
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Other(anyhow::Error::new(e)))?
            .as_millis() as u64;
        let index = now_ms / window_ms;
        let key = format!("ratelimit:{}:{}:{}", preset.name, subject, index);

        let count = match &self.primary {
            Some(primary) => match primary.incr(&key, preset.window).await {
                Ok(count) => count,
                Err(e) => {
                    tracing::warn!(error = %e, "primary rate limit store failed, using fallback");
                    self.fallback.incr(&key, preset.window).await?
                }
            },
            None => self.fallback.incr(&key, preset.window).await?,
        };

        if count > preset.max_requests {
            let retry_after = Duration::from_millis(window_ms - now_ms % window_ms);
            tracing::debug!(
                subject,
                limit = preset.name,
                count,
                "rate limit exceeded"
            );
            return Err(Error::RateLimit { retry_after });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: RateLimitPreset = RateLimitPreset {
        name: "tiny",
        window: Duration::from_secs(3600),
        max_requests: 2,
    };

    #[tokio::test]
    async fn admits_up_to_cap_then_rejects() {
        let limiter = RateLimiter::new(None);
        limiter.check("alice", TINY).await.unwrap();
        limiter.check("alice", TINY).await.unwrap();
        let err = limiter.check("alice", TINY).await.unwrap_err();
        match err {
            Error::RateLimit { retry_after } => {
                assert!(retry_after <= TINY.window);
            }
            other => panic!("expected RateLimit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subjects_are_independent() {
        let limiter = RateLimiter::new(None);
        limiter.check("alice", TINY).await.unwrap();
        limiter.check("alice", TINY).await.unwrap();
        assert!(limiter.check("alice", TINY).await.is_err());
        limiter.check("bob", TINY).await.unwrap();
    }

    #[tokio::test]
    async fn presets_are_independent() {
        let limiter = RateLimiter::new(None);
        limiter.check("alice", TINY).await.unwrap();
        limiter.check("alice", TINY).await.unwrap();
        assert!(limiter.check("alice", TINY).await.is_err());
        limiter.check("alice", STANDARD_READ).await.unwrap();
    }

    #[tokio::test]
    async fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::disabled();
        for _ in 0..100 {
            limiter.check("alice", ANALYZE).await.unwrap();
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn incr(&self, _key: &str, _expiry: Duration) -> Result<u64> {
            Err(Error::external("store down"))
        }
    }

    #[tokio::test]
    async fn primary_failure_falls_back_and_still_enforces() {
        let limiter = RateLimiter::new(Some(Arc::new(BrokenStore)));
        limiter.check("alice", TINY).await.unwrap();
        limiter.check("alice", TINY).await.unwrap();
        assert!(limiter.check("alice", TINY).await.is_err());
    }

    #[tokio::test]
    async fn memory_store_resets_expired_windows() {
        let store = MemoryCounterStore::new();
        store.incr("k", Duration::from_millis(10)).await.unwrap();
        store.incr("k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let count = store.incr("k", Duration::from_millis(10)).await.unwrap();
        assert_eq!(count, 1);
    }
}
