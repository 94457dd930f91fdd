//! Read-only view of a caller's bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::bucket::TokenBucket;
use super::limit::LimitConfig;

/// Lifecycle status reported by quota inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaStatus {
    /// Nothing stored yet; full quota.
    New,
    /// Stored state found and projected forward.
    Active,
    /// Stored state was unreadable; reported as full.
    Reset,
}

impl QuotaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaStatus::New => "new",
            QuotaStatus::Active => "active",
            QuotaStatus::Reset => "reset",
        }
    }
}

/// Projected bucket state at inspection time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    /// Whole tokens available now.
    pub remaining: u64,
    pub limit: f64,
    pub rate: f64,
    pub status: QuotaStatus,
    pub last_activity: Option<DateTime<Utc>>,
}

impl QuotaSnapshot {
    /// Project `stored` to `now_ms` by refilling only; nothing is consumed.
    pub fn project(stored: Option<&str>, defaults: &LimitConfig, now_ms: i64) -> Self {
        let full = |status| Self {
            remaining: defaults.capacity.floor() as u64,
            limit: defaults.capacity,
            rate: defaults.rate,
            status,
            last_activity: None,
        };

        let Some(raw) = stored else {
            return full(QuotaStatus::New);
        };

        match TokenBucket::deserialize(raw) {
            Ok(bucket) => {
                let current = bucket.refill(now_ms);
                Self {
                    remaining: current.tokens.floor() as u64,
                    limit: bucket.capacity,
                    rate: bucket.rate,
                    status: QuotaStatus::Active,
                    last_activity: DateTime::from_timestamp_millis(bucket.last_refill),
                }
            }
            Err(_) => full(QuotaStatus::Reset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_bucket_is_new() {
        let snapshot = QuotaSnapshot::project(None, &LimitConfig::default(), 0);
        assert_eq!(snapshot.status, QuotaStatus::New);
        assert_eq!(snapshot.remaining, 100);
        assert!(snapshot.last_activity.is_none());
    }

    #[test]
    fn test_active_bucket_is_refilled_not_consumed() {
        let stored = "[10, 2, 3.5, 1700000000000]";
        let snapshot =
            QuotaSnapshot::project(Some(stored), &LimitConfig::default(), 1_700_000_001_000);
        assert_eq!(snapshot.status, QuotaStatus::Active);
        assert_eq!(snapshot.remaining, 5);
        assert_eq!(snapshot.limit, 10.0);
        assert_eq!(snapshot.rate, 2.0);
        assert_eq!(
            snapshot.last_activity.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
    }

    #[test]
    fn test_clock_behind_last_refill_does_not_mint_tokens() {
        let stored = "[10, 2, 3.5, 5000]";
        let snapshot = QuotaSnapshot::project(Some(stored), &LimitConfig::default(), 1_000);
        assert_eq!(snapshot.remaining, 3);
    }

    #[test]
    fn test_corrupt_bucket_reports_reset() {
        let snapshot = QuotaSnapshot::project(Some("[1,2]"), &LimitConfig::default(), 0);
        assert_eq!(snapshot.status, QuotaStatus::Reset);
        assert_eq!(snapshot.remaining, 100);
    }
}
