//! Middleware modules.

pub mod client_key;
pub mod error;
pub mod rate_limit;
