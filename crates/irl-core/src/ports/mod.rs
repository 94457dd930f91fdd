//! Ports - trait definitions for external dependencies.
//! These are the "interfaces" that infrastructure must implement.

mod bucket_store;
mod clock;
mod rate_limit;

pub use bucket_store::{BucketStore, StoreError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use rate_limit::{
    HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER, RateLimitDecision,
    RateLimitError, RateLimiter,
};
