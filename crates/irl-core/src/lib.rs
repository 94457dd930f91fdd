//! # IRL Core
//!
//! The domain layer of the IRL rate limiter: the token bucket model, the
//! ports a shared bucket store must satisfy, and the engine that turns store
//! outcomes into admission decisions.
//! This crate performs no I/O of its own.

pub mod domain;
pub mod error;
pub mod ports;
pub mod service;

pub use error::BucketError;
pub use service::TokenBucketLimiter;
