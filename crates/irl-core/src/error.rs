//! Domain-level error types.

use thiserror::Error;

/// Bucket model errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BucketError {
    /// Non-positive capacity, negative rate or a non-finite parameter.
    /// Rejected at configuration time, never silently corrected.
    #[error("Invalid bucket configuration: {0}")]
    InvalidConfiguration(String),

    /// Stored representation is not a 4-element array of finite numbers.
    #[error("Malformed bucket state: {0}")]
    MalformedState(String),
}
