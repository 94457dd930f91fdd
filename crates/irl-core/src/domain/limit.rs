//! Limit configuration and the atomic consume request/outcome.

use serde::{Deserialize, Serialize};

use super::bucket::TokenBucket;
use crate::error::BucketError;

/// Sentinel `retry_after_ms` meaning the bucket will never refill.
pub const RETRY_NEVER: i64 = -1;

/// Per-route bucket parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitConfig {
    pub capacity: f64,
    pub rate: f64,
    pub tokens_per_request: f64,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            capacity: 100.0,
            rate: 10.0,
            tokens_per_request: 1.0,
        }
    }
}

impl LimitConfig {
    /// Validated constructor.
    pub fn new(capacity: f64, rate: f64, tokens_per_request: f64) -> Result<Self, BucketError> {
        let config = Self {
            capacity,
            rate,
            tokens_per_request,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BucketError> {
        TokenBucket::new(self.capacity, self.rate, 0)?;
        if !(self.tokens_per_request.is_finite() && self.tokens_per_request > 0.0) {
            return Err(BucketError::InvalidConfiguration(format!(
                "tokens per request must be positive, got {}",
                self.tokens_per_request
            )));
        }
        Ok(())
    }

    /// Consume request for `amount` tokens at `now_ms`.
    pub fn request(&self, amount: f64, now_ms: i64) -> BucketRequest {
        BucketRequest {
            capacity: self.capacity,
            rate: self.rate,
            amount,
            now_ms,
        }
    }
}

/// Arguments of one atomic read-refill-consume-write cycle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketRequest {
    pub capacity: f64,
    pub rate: f64,
    pub amount: f64,
    pub now_ms: i64,
}

/// How the stored state was interpreted by the atomic operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredState {
    /// No state under the key.
    Missing,
    /// Valid state was found.
    Existing,
    /// State failed validation and was replaced by a full bucket.
    Recovered,
}

/// Result of the atomic operation, as returned by the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    pub allowed: bool,
    /// Tokens left after the operation; may be fractional.
    pub remaining: f64,
    /// `0` when allowed, [`RETRY_NEVER`] for a denied zero-rate bucket.
    pub retry_after_ms: i64,
}

impl ConsumeOutcome {
    /// Whether a denied request can ever succeed by waiting.
    pub fn never_refills(&self) -> bool {
        !self.allowed && self.retry_after_ms < 0
    }
}

/// Bucket written back by the atomic operation, with its outcome.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AppliedConsume {
    pub bucket: TokenBucket,
    pub outcome: ConsumeOutcome,
    pub state: StoredState,
}

impl BucketRequest {
    /// Run the consume cycle against the raw stored value.
    ///
    /// Missing or malformed state is treated as a fresh full bucket. The
    /// request's capacity and rate win over whatever was stored; stored tokens
    /// are clamped to the current capacity. Store adapters that cannot run
    /// server-side scripts call this while holding exclusive access to the key.
    pub fn apply(&self, stored: Option<&str>) -> Result<AppliedConsume, BucketError> {
        let fresh = TokenBucket::new(self.capacity, self.rate, self.now_ms)?;

        let (bucket, state) = match stored.map(TokenBucket::deserialize) {
            None => (fresh, StoredState::Missing),
            Some(Ok(previous)) => (
                TokenBucket::with_tokens(
                    self.capacity,
                    self.rate,
                    previous.tokens,
                    previous.last_refill,
                )?,
                StoredState::Existing,
            ),
            Some(Err(_)) => (fresh, StoredState::Recovered),
        };

        let (bucket, allowed) = bucket.consume(self.amount, self.now_ms);
        let retry_after_ms = if allowed {
            0
        } else {
            bucket
                .retry_after_ms(self.amount)
                .map_or(RETRY_NEVER, |ms| i64::try_from(ms).unwrap_or(i64::MAX))
        };

        Ok(AppliedConsume {
            bucket,
            outcome: ConsumeOutcome {
                allowed,
                remaining: bucket.tokens,
                retry_after_ms,
            },
            state,
        })
    }
}
