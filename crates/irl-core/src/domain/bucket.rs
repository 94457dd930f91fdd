//! Token bucket model.
//!
//! A bucket is a plain value: `refill` and `consume` return the updated state
//! instead of mutating in place, so the arithmetic is testable without a store.
//! The stored form is the compact JSON array `[capacity, rate, tokens, lastRefill]`.

use serde_json::Value;

use crate::error::BucketError;

/// Seconds an idle bucket is kept past the point it would be full again.
pub const TTL_GRACE_SECS: u64 = 60;

/// TTL for buckets that never refill.
pub const ZERO_RATE_TTL_SECS: u64 = 60;

/// Token bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    /// Maximum permits held.
    pub capacity: f64,
    /// Permits added per second. Zero means a one-shot bucket.
    pub rate: f64,
    /// Current permits, always within `[0, capacity]`.
    pub tokens: f64,
    /// Milliseconds since epoch at which `tokens` was last brought up to date.
    pub last_refill: i64,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: f64, rate: f64, now_ms: i64) -> Result<Self, BucketError> {
        Self::with_tokens(capacity, rate, capacity, now_ms)
    }

    /// Create a bucket holding `tokens`, clamped into `[0, capacity]`.
    pub fn with_tokens(
        capacity: f64,
        rate: f64,
        tokens: f64,
        last_refill: i64,
    ) -> Result<Self, BucketError> {
        validate(capacity, rate)?;
        if tokens.is_nan() {
            return Err(BucketError::InvalidConfiguration(
                "initial tokens must be a number".to_string(),
            ));
        }

        Ok(Self {
            capacity,
            rate,
            tokens: tokens.clamp(0.0, capacity),
            last_refill,
        })
    }

    /// Bring `tokens` up to date at `now_ms`.
    ///
    /// A timestamp at or before `last_refill` is a no-op: callers on different
    /// hosts may disagree about the time, and a clock moving backwards must
    /// never mint tokens or rewind `last_refill`.
    pub fn refill(self, now_ms: i64) -> Self {
        if now_ms <= self.last_refill {
            return self;
        }

        let elapsed_secs = (now_ms - self.last_refill) as f64 / 1000.0;
        Self {
            tokens: (self.tokens + elapsed_secs * self.rate).min(self.capacity),
            last_refill: now_ms,
            ..self
        }
    }

    /// Refill, then deduct `amount` if available.
    ///
    /// Returns the updated bucket and whether the deduction happened. A failed
    /// consume leaves the refilled token count untouched.
    pub fn consume(self, amount: f64, now_ms: i64) -> (Self, bool) {
        let mut bucket = self.refill(now_ms);
        if bucket.tokens >= amount {
            bucket.tokens -= amount;
            (bucket, true)
        } else {
            (bucket, false)
        }
    }

    /// Whole seconds until `amount` tokens are available, without refilling.
    ///
    /// `None` when the bucket never refills and cannot satisfy `amount`.
    pub fn time_until_available(&self, amount: f64) -> Option<u64> {
        if self.tokens >= amount {
            Some(0)
        } else if self.rate <= 0.0 {
            None
        } else {
            Some(((amount - self.tokens) / self.rate).ceil() as u64)
        }
    }

    /// Milliseconds until `amount` tokens are available; `None` means never.
    pub fn retry_after_ms(&self, amount: f64) -> Option<u64> {
        if self.tokens >= amount {
            Some(0)
        } else if self.rate <= 0.0 {
            None
        } else {
            Some(((amount - self.tokens) / self.rate * 1000.0).ceil() as u64)
        }
    }

    /// Idle expiry for the stored representation.
    pub fn ttl_secs(&self) -> u64 {
        ttl_secs(self.capacity, self.rate)
    }

    /// Encode as `[capacity, rate, tokens, lastRefill]`.
    pub fn serialize(&self) -> String {
        serde_json::json!([self.capacity, self.rate, self.tokens, self.last_refill]).to_string()
    }

    /// Decode the compact array form.
    ///
    /// Fails with [`BucketError::MalformedState`] unless the input is an array
    /// whose first four elements are finite numbers describing a valid bucket.
    pub fn deserialize(raw: &str) -> Result<Self, BucketError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| BucketError::MalformedState(e.to_string()))?;

        let items = value
            .as_array()
            .ok_or_else(|| BucketError::MalformedState("expected an array".to_string()))?;

        if items.len() < 4 {
            return Err(BucketError::MalformedState(format!(
                "expected 4 elements, found {}",
                items.len()
            )));
        }

        let mut fields = [0.0_f64; 4];
        for (slot, item) in fields.iter_mut().zip(items) {
            *slot = item
                .as_f64()
                .filter(|v| v.is_finite())
                .ok_or_else(|| BucketError::MalformedState(format!("not a finite number: {item}")))?;
        }

        let [capacity, rate, tokens, last_refill] = fields;
        Self::with_tokens(capacity, rate, tokens, last_refill as i64)
            .map_err(|e| BucketError::MalformedState(e.to_string()))
    }
}

/// `ceil(capacity / rate) + 60` seconds, or a fixed fallback for zero-rate buckets.
pub fn ttl_secs(capacity: f64, rate: f64) -> u64 {
    if rate > 0.0 {
        (capacity / rate).ceil() as u64 + TTL_GRACE_SECS
    } else {
        ZERO_RATE_TTL_SECS
    }
}

fn validate(capacity: f64, rate: f64) -> Result<(), BucketError> {
    if !(capacity.is_finite() && capacity > 0.0) {
        return Err(BucketError::InvalidConfiguration(format!(
            "capacity must be positive, got {capacity}"
        )));
    }
    if !(rate.is_finite() && rate >= 0.0) {
        return Err(BucketError::InvalidConfiguration(format!(
            "rate cannot be negative, got {rate}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_bucket_starts_full() {
        let bucket = TokenBucket::new(10.0, 1.0, 1_000).unwrap();
        assert_eq!(bucket.tokens, 10.0);
        assert_eq!(bucket.last_refill, 1_000);
    }

    #[test]
    fn test_rejects_invalid_configuration() {
        assert!(matches!(
            TokenBucket::new(0.0, 1.0, 0),
            Err(BucketError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            TokenBucket::new(-5.0, 1.0, 0),
            Err(BucketError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            TokenBucket::new(10.0, -0.5, 0),
            Err(BucketError::InvalidConfiguration(_))
        ));
        assert!(matches!(
            TokenBucket::new(f64::NAN, 1.0, 0),
            Err(BucketError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_initial_tokens_are_clamped() {
        assert_eq!(TokenBucket::with_tokens(5.0, 1.0, 50.0, 0).unwrap().tokens, 5.0);
        assert_eq!(TokenBucket::with_tokens(5.0, 1.0, -3.0, 0).unwrap().tokens, 0.0);
    }

    #[test]
    fn test_refill_adds_elapsed_tokens() {
        let bucket = TokenBucket::with_tokens(10.0, 2.0, 0.0, 0).unwrap();
        let refilled = bucket.refill(1_500);
        assert_eq!(refilled.tokens, 3.0);
        assert_eq!(refilled.last_refill, 1_500);
    }

    #[test]
    fn test_refill_never_exceeds_capacity() {
        for rate in [0.0, 0.5, 1.0, 10.0, 1_000.0] {
            for elapsed in [0_i64, 1, 999, 60_000, 86_400_000] {
                let bucket = TokenBucket::with_tokens(7.0, rate, 3.0, 0).unwrap();
                let refilled = bucket.refill(elapsed);
                assert!(refilled.tokens <= 7.0, "rate={rate} elapsed={elapsed}");
                assert!(refilled.tokens >= 3.0);
            }
        }
    }

    #[test]
    fn test_refill_ignores_clock_moving_backwards() {
        let bucket = TokenBucket::with_tokens(10.0, 5.0, 2.0, 10_000).unwrap();
        let skewed = bucket.refill(4_000);
        assert_eq!(skewed.tokens, 2.0);
        assert_eq!(skewed.last_refill, 10_000);

        let same = bucket.refill(10_000);
        assert_eq!(same, bucket);
    }

    #[test]
    fn test_consume_deducts_when_available() {
        let bucket = TokenBucket::new(10.0, 1.0, 0).unwrap();
        let (bucket, allowed) = bucket.consume(1.0, 0);
        assert!(allowed);
        assert_eq!(bucket.tokens, 9.0);
    }

    #[test]
    fn test_failed_consume_leaves_tokens_unchanged() {
        let bucket = TokenBucket::with_tokens(10.0, 0.0, 4.0, 0).unwrap();
        let (after, allowed) = bucket.consume(5.0, 100);
        assert!(!allowed);
        assert_eq!(after.tokens, 4.0);
    }

    #[test]
    fn test_zero_rate_allows_exactly_capacity() {
        let mut bucket = TokenBucket::new(5.0, 0.0, 0).unwrap();
        let mut allowed_count = 0;
        for step in 0..12 {
            let (next, allowed) = bucket.consume(1.0, step * 1_000);
            bucket = next;
            if allowed {
                allowed_count += 1;
            } else {
                assert_eq!(bucket.tokens, 0.0);
            }
        }
        assert_eq!(allowed_count, 5);
    }

    #[test]
    fn test_time_until_available() {
        let full = TokenBucket::new(10.0, 2.0, 0).unwrap();
        assert_eq!(full.time_until_available(3.0), Some(0));

        let empty = TokenBucket::with_tokens(10.0, 2.0, 0.5, 0).unwrap();
        assert_eq!(empty.time_until_available(3.0), Some(2));
        assert_eq!(empty.retry_after_ms(3.0), Some(1_250));

        let one_shot = TokenBucket::with_tokens(10.0, 0.0, 0.0, 0).unwrap();
        assert_eq!(one_shot.time_until_available(1.0), None);
        assert_eq!(one_shot.retry_after_ms(1.0), None);
    }

    #[test]
    fn test_ttl() {
        assert_eq!(ttl_secs(100.0, 10.0), 70);
        assert_eq!(ttl_secs(10.0, 3.0), 64);
        assert_eq!(ttl_secs(10.0, 0.0), ZERO_RATE_TTL_SECS);
    }

    #[test]
    fn test_serialize_round_trip() {
        let bucket = TokenBucket::with_tokens(12.5, 0.25, 3.75, 1_700_000_000_123).unwrap();
        let encoded = bucket.serialize();
        assert_eq!(TokenBucket::deserialize(&encoded).unwrap(), bucket);
    }

    #[test]
    fn test_deserialize_accepts_integer_encoding() {
        let bucket = TokenBucket::deserialize("[10,1,9,1000]").unwrap();
        assert_eq!(bucket.capacity, 10.0);
        assert_eq!(bucket.tokens, 9.0);
        assert_eq!(bucket.last_refill, 1_000);
    }

    #[test]
    fn test_deserialize_rejects_malformed_input() {
        for raw in [
            "[10, 1, 9]",
            "{\"capacity\": 10}",
            "\"hello\"",
            "[10, 1, null, 1000]",
            "[10, \"1\", 9, 1000]",
            "[10, 1, 9, 1e400]",
            "[0, 1, 0, 1000]",
            "not json",
        ] {
            assert!(
                matches!(TokenBucket::deserialize(raw), Err(BucketError::MalformedState(_))),
                "accepted {raw}"
            );
        }
    }
}
