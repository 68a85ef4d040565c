//! Request-budget limiter backed by the shared cache.
//!
//! Two independent fixed windows (minute and hour) are checked per request.
//! Counters live in the cache under window-aligned keys, so every node of a
//! deployment draws from the same budget.

use crate::cache::Cache;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Budgets for one named consumer. A budget of zero disables that window.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub key: String,
    pub per_minute: u64,
    pub per_hour: u64,
}

/// Sliding-budget gate for calls to external services.
pub struct RateLimiter {
    cache: Arc<dyn Cache>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn Cache>, config: RateLimitConfig) -> Self {
        Self { cache, config }
    }

    /// Whether one more request fits the budgets. Cache failures count as
    /// "no": better to drop a scan than to flood a metered upstream.
    pub async fn is_allowed(&self) -> bool {
        let now = Utc::now().timestamp();

        if self.config.per_minute > 0 {
            let key = format!("ratelimit:minute:{}:{}", self.config.key, now / 60);
            match self.cache.incr(&key, Duration::from_secs(120)).await {
                Ok(count) if count <= self.config.per_minute => {}
                Ok(_) => return false,
                Err(err) => {
                    tracing::warn!(error = %err, "rate limit check failed");
                    return false;
                }
            }
        }

        if self.config.per_hour > 0 {
            let key = format!("ratelimit:hour:{}:{}", self.config.key, now / 3600);
            match self.cache.incr(&key, Duration::from_secs(7200)).await {
                Ok(count) if count <= self.config.per_hour => {}
                Ok(_) => return false,
                Err(err) => {
                    tracing::warn!(error = %err, "rate limit check failed");
                    return false;
                }
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn limiter(per_minute: u64, per_hour: u64) -> RateLimiter {
        RateLimiter::new(
            Arc::new(MemoryCache::new()),
            RateLimitConfig {
                key: "test".into(),
                per_minute,
                per_hour,
            },
        )
    }

    #[tokio::test]
    async fn test_minute_budget_exhausts() {
        let limiter = limiter(3, 0);

        for _ in 0..3 {
            assert!(limiter.is_allowed().await);
        }
        assert!(!limiter.is_allowed().await);
    }

    #[tokio::test]
    async fn test_hour_budget_exhausts() {
        let limiter = limiter(0, 2);

        assert!(limiter.is_allowed().await);
        assert!(limiter.is_allowed().await);
        assert!(!limiter.is_allowed().await);
    }

    #[tokio::test]
    async fn test_zero_budgets_always_allow() {
        let limiter = limiter(0, 0);
        for _ in 0..100 {
            assert!(limiter.is_allowed().await);
        }
    }
}
