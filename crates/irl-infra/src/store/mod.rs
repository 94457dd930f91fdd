//! Bucket store implementations - Redis and in-memory fallback.

mod memory;

pub use memory::InMemoryBucketStore;

#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "redis")]
pub use self::redis::{RedisBucketStore, RedisConfig};
