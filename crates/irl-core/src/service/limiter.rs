//! Token bucket rate limiter engine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ConsumeOutcome, LimitConfig, QuotaSnapshot, TokenBucket};
use crate::ports::{
    BucketStore, Clock, RateLimitDecision, RateLimitError, RateLimiter, SystemClock,
};

/// Compose the store key for a caller.
pub fn bucket_key(prefix: &str, identifier: &str) -> String {
    format!("{prefix}:{identifier}")
}

/// Rate limiter backed by a shared [`BucketStore`].
///
/// Holds no bucket state of its own: every decision is one atomic store call,
/// so instances can sit behind any load balancer.
pub struct TokenBucketLimiter {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(store: Arc<dyn BucketStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn BucketStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn check(
        &self,
        key: &str,
        config: &LimitConfig,
    ) -> Result<RateLimitDecision, RateLimitError> {
        let now_ms = self.clock.now_ms();
        let request = config.request(config.tokens_per_request, now_ms);

        let outcome = self.store.consume(key, request).await.map_err(|e| {
            tracing::warn!(key = %key, error = %e, "Bucket store call failed");
            RateLimitError::from(e)
        })?;

        let decision = decide(config, &outcome, now_ms);
        if decision.allowed {
            tracing::debug!(key = %key, remaining = decision.remaining, "Request allowed");
        } else {
            tracing::info!(
                key = %key,
                remaining = decision.remaining,
                retry_after_ms = decision.retry_after_ms,
                "Rate limit exceeded"
            );
        }

        Ok(decision)
    }

    async fn inspect(
        &self,
        key: &str,
        defaults: &LimitConfig,
    ) -> Result<QuotaSnapshot, RateLimitError> {
        let stored = self.store.get(key).await?;
        Ok(QuotaSnapshot::project(
            stored.as_deref(),
            defaults,
            self.clock.now_ms(),
        ))
    }
}

/// Turn a store outcome into client-facing values.
fn decide(config: &LimitConfig, outcome: &ConsumeOutcome, now_ms: i64) -> RateLimitDecision {
    let remaining = outcome.remaining.clamp(0.0, config.capacity);

    // Bucket as left by the store; projects when the next request fits.
    let after = TokenBucket {
        capacity: config.capacity,
        rate: config.rate,
        tokens: remaining,
        last_refill: now_ms,
    };
    let reset = after
        .time_until_available(config.tokens_per_request)
        .map(|secs| {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            now_ms.div_euclid(1000).saturating_add(secs)
        });

    RateLimitDecision {
        allowed: outcome.allowed,
        limit: config.capacity,
        remaining: remaining.floor() as u64,
        reset,
        retry_after_ms: outcome.retry_after_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use crate::domain::{BucketRequest, RETRY_NEVER};
    use crate::ports::{ManualClock, StoreError};

    /// Serializes every consume behind one lock.
    #[derive(Default)]
    struct LockedStore {
        data: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl BucketStore for LockedStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.data.lock().unwrap().get(key).cloned())
        }

        async fn set_ex(&self, key: &str, value: &str, _ttl: u64) -> Result<(), StoreError> {
            self.data
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn consume(
            &self,
            key: &str,
            request: BucketRequest,
        ) -> Result<ConsumeOutcome, StoreError> {
            let mut data = self.data.lock().unwrap();
            let applied = request
                .apply(data.get(key).map(String::as_str))
                .map_err(|e| StoreError::Protocol(e.to_string()))?;
            data.insert(key.to_string(), applied.bucket.serialize());
            Ok(applied.outcome)
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    struct DownStore;

    #[async_trait]
    impl BucketStore for DownStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }

        async fn set_ex(&self, _key: &str, _value: &str, _ttl: u64) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }

        async fn consume(
            &self,
            _key: &str,
            _request: BucketRequest,
        ) -> Result<ConsumeOutcome, StoreError> {
            Err(StoreError::Timeout(1_000))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Connection("refused".to_string()))
        }
    }

    const T0: i64 = 1_700_000_000_000;

    fn limiter(clock: Arc<ManualClock>) -> TokenBucketLimiter {
        TokenBucketLimiter::with_clock(Arc::new(LockedStore::default()), clock)
    }

    #[test]
    fn test_bucket_key() {
        assert_eq!(bucket_key("ratelimit:agent", "a-1"), "ratelimit:agent:a-1");
    }

    #[tokio::test]
    async fn test_allowed_decision_headers() {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = limiter(clock);
        let config = LimitConfig::new(10.0, 1.0, 1.0).unwrap();

        let decision = limiter.check("k", &config).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 10.0);
        assert_eq!(decision.remaining, 9);
        assert_eq!(decision.reset, Some(T0 / 1000));
        assert_eq!(decision.retry_after_secs(), Some(0));
    }

    #[tokio::test]
    async fn test_scenario_deny_then_refill() {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = limiter(clock.clone());
        let one = LimitConfig::new(10.0, 1.0, 1.0).unwrap();
        let ten = LimitConfig::new(10.0, 1.0, 10.0).unwrap();

        assert!(limiter.check("k", &one).await.unwrap().allowed);

        let denied = limiter.check("k", &ten).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 9);
        assert_eq!(denied.retry_after_ms, 1_000);
        assert_eq!(denied.retry_after_secs(), Some(1));
        assert_eq!(denied.reset, Some(T0 / 1000 + 1));

        clock.advance(1_000);
        let later = limiter.check("k", &one).await.unwrap();
        assert!(later.allowed);
        assert_eq!(later.remaining, 9);
    }

    #[tokio::test]
    async fn test_zero_rate_denial_has_no_reset() {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = limiter(clock);
        let config = LimitConfig::new(5.0, 0.0, 1.0).unwrap();

        for _ in 0..5 {
            assert!(limiter.check("k", &config).await.unwrap().allowed);
        }
        let denied = limiter.check("k", &config).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_ms, RETRY_NEVER);
        assert_eq!(denied.reset, None);
        assert_eq!(denied.retry_after_secs(), None);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = limiter(clock);
        let config = LimitConfig::new(1.0, 0.0, 1.0).unwrap();

        assert!(limiter.check("a", &config).await.unwrap().allowed);
        assert!(!limiter.check("a", &config).await.unwrap().allowed);
        assert!(limiter.check("b", &config).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_store_failure_is_backend_unavailable() {
        let limiter = TokenBucketLimiter::new(Arc::new(DownStore));
        let result = limiter.check("k", &LimitConfig::default()).await;
        assert!(matches!(result, Err(RateLimitError::BackendUnavailable(_))));

        let result = limiter.inspect("k", &LimitConfig::default()).await;
        assert!(matches!(result, Err(RateLimitError::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_inspect_does_not_consume() {
        let clock = Arc::new(ManualClock::new(T0));
        let limiter = limiter(clock);
        let config = LimitConfig::new(10.0, 0.0, 3.0).unwrap();

        limiter.check("k", &config).await.unwrap();
        let first = limiter.inspect("k", &config).await.unwrap();
        let second = limiter.inspect("k", &config).await.unwrap();
        assert_eq!(first.remaining, 7);
        assert_eq!(second.remaining, 7);
    }

    #[tokio::test]
    async fn test_distant_reset_saturates() {
        let limiter = limiter(Arc::new(ManualClock::new(T0)));
        let config = LimitConfig::new(10.0, 1e-9, 1e300).unwrap();

        let denied = limiter.check("k", &config).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, i64::MAX);
        assert_eq!(denied.reset, Some(i64::MAX));
        assert!(denied.retry_after_secs().is_some());
    }
}
