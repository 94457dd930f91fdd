//! Services composing the domain with the ports.

mod limiter;

pub use limiter::{TokenBucketLimiter, bucket_key};
