//! Application state - shared across all handlers.

use std::sync::Arc;

use irl_core::TokenBucketLimiter;
use irl_core::domain::LimitConfig;
use irl_core::ports::{BucketStore, RateLimiter};
use irl_infra::InMemoryBucketStore;

use crate::config::AppConfig;
use crate::middleware::rate_limit::{FailurePolicy, RateLimitPolicy};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<dyn RateLimiter>,
    pub store: Arc<dyn BucketStore>,
    /// Limits of `POST /api/request` and `GET /api/quota/{agentId}`.
    pub agent_quota: LimitConfig,
    /// Address-keyed middleware policy.
    pub address_policy: RateLimitPolicy,
    /// Agent-keyed middleware policy.
    pub agent_policy: RateLimitPolicy,
}

impl AppState {
    /// Build the application state with the configured store.
    pub async fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let store = build_store(config).await?;
        Self::with_store(config, store)
    }

    /// Build the state around an existing store.
    pub fn with_store(config: &AppConfig, store: Arc<dyn BucketStore>) -> anyhow::Result<Self> {
        let settings = &config.rate_limit;
        let failure = if settings.fail_closed {
            FailurePolicy::Closed
        } else {
            FailurePolicy::Open
        };

        let address_policy = RateLimitPolicy::builder()
            .limit(settings.limit)
            .key_prefix(settings.key_prefix.clone())
            .trust_proxy(settings.trust_proxy)
            .failure_policy(failure)
            .build()?;

        let agent_policy = RateLimitPolicy::agent_builder()
            .limit(settings.limit)
            .trust_proxy(settings.trust_proxy)
            .failure_policy(failure)
            .build()?;

        let limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::new(store.clone()));

        tracing::info!(
            capacity = settings.limit.capacity,
            rate = settings.limit.rate,
            agent_capacity = config.agent_quota.capacity,
            agent_rate = config.agent_quota.rate,
            fail_closed = settings.fail_closed,
            "Application state initialized"
        );

        Ok(Self {
            limiter,
            store,
            agent_quota: config.agent_quota,
            address_policy,
            agent_policy,
        })
    }
}

#[cfg(feature = "redis")]
async fn build_store(config: &AppConfig) -> anyhow::Result<Arc<dyn BucketStore>> {
    use irl_infra::RedisBucketStore;

    let fallback = config.redis.fallback_to_memory;
    let store = match RedisBucketStore::new(config.redis.clone()) {
        Ok(store) => store,
        Err(e) if fallback => {
            tracing::error!(error = %e, "Invalid Redis configuration. Using in-memory store.");
            return Ok(Arc::new(InMemoryBucketStore::new()));
        }
        Err(e) => return Err(e.into()),
    };

    if fallback {
        if let Err(e) = store.ping().await {
            tracing::error!(
                error = %e,
                "Failed to connect to Redis. Using in-memory store."
            );
            return Ok(Arc::new(InMemoryBucketStore::new()));
        }
    }

    // Without the fallback the connection is made lazily, so the server
    // comes up even while Redis is down and the middleware fails open.
    tracing::info!("Using Redis bucket store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn build_store(_config: &AppConfig) -> anyhow::Result<Arc<dyn BucketStore>> {
    tracing::info!("Running without redis feature - using in-memory bucket store");
    Ok(Arc::new(InMemoryBucketStore::new()))
}
