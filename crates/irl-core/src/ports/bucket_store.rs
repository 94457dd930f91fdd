//! Shared bucket store port.

use async_trait::async_trait;

use crate::domain::{BucketRequest, ConsumeOutcome};

/// Shared key-value store holding bucket state for every service instance.
///
/// `consume` must be a single store-side atomic operation: one round trip,
/// with no other operation on the same key interleaved between the read and
/// the write. Implementations must never emulate it with a separate read and
/// conditional write from the caller.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Raw stored value under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store `value` under `key`, expiring after `ttl_secs`.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;

    /// Atomic read-refill-consume-write-persist for `key`.
    async fn consume(&self, key: &str, request: BucketRequest)
    -> Result<ConsumeOutcome, StoreError>;

    /// Liveness probe.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Store failures. All of them mean "no decision was obtained".
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    Protocol(String),
}
