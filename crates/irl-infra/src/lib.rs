//! # IRL Infrastructure
//!
//! Concrete implementations of the bucket store port defined in `irl-core`.
//!
//! ## Feature Flags
//!
//! - `full` (default) - All features enabled
//! - `minimal` - No external dependencies, in-memory only
//! - `redis` - Redis-backed store running the token bucket as a Lua script

pub mod store;

// Re-exports - In-Memory
pub use store::InMemoryBucketStore;

// Re-exports - Redis
#[cfg(feature = "redis")]
pub use store::{RedisBucketStore, RedisConfig};
