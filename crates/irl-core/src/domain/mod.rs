//! Domain types - the token bucket and the values that flow around it.

mod bucket;
mod limit;
mod quota;

pub use bucket::{TTL_GRACE_SECS, TokenBucket, ZERO_RATE_TTL_SECS, ttl_secs};
pub use limit::{
    AppliedConsume, BucketRequest, ConsumeOutcome, LimitConfig, RETRY_NEVER, StoredState,
};
pub use quota::{QuotaSnapshot, QuotaStatus};
