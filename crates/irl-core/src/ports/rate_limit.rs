//! Rate limiting port.

use async_trait::async_trait;

use super::bucket_store::StoreError;
use crate::domain::{LimitConfig, QuotaSnapshot};

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

/// Rate limiter trait - the request-facing decision function.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume `config.tokens_per_request` from the bucket at `key`.
    async fn check(
        &self,
        key: &str,
        config: &LimitConfig,
    ) -> Result<RateLimitDecision, RateLimitError>;

    /// Report the bucket at `key` without consuming anything.
    async fn inspect(
        &self,
        key: &str,
        defaults: &LimitConfig,
    ) -> Result<QuotaSnapshot, RateLimitError>;
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Bucket capacity.
    pub limit: f64,
    /// Remaining tokens, floored for display.
    pub remaining: u64,
    /// Unix seconds at which the next request becomes satisfiable.
    /// `None` when that never happens.
    pub reset: Option<i64>,
    /// Raw store hint: `0` when allowed, `-1` for never.
    pub retry_after_ms: i64,
}

impl RateLimitDecision {
    /// Whole seconds a denied client should back off; `None` means never.
    pub fn retry_after_secs(&self) -> Option<u64> {
        if self.allowed {
            Some(0)
        } else if self.retry_after_ms < 0 {
            None
        } else {
            Some((self.retry_after_ms as u64).div_ceil(1000))
        }
    }

    /// `X-RateLimit-*` headers for this decision, plus `Retry-After` on a
    /// denial that can eventually succeed.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
        ];
        if let Some(reset) = self.reset {
            headers.push((HEADER_RESET, reset.to_string()));
        }
        if !self.allowed {
            if let Some(secs) = self.retry_after_secs() {
                headers.push((HEADER_RETRY_AFTER, secs.to_string()));
            }
        }
        headers
    }
}

/// Rate limit errors.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The shared store could not produce a decision. The caller decides
    /// whether that means allow or deny.
    #[error("Rate limit backend unavailable: {0}")]
    BackendUnavailable(#[from] StoreError),
}
