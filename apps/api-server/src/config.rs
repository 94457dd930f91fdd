//! Application configuration loaded from environment variables.

use std::env;
use std::str::FromStr;

use irl_core::BucketError;
use irl_core::domain::LimitConfig;

#[cfg(feature = "redis")]
use irl_infra::RedisConfig;

use crate::middleware::rate_limit::DEFAULT_KEY_PREFIX;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    #[cfg(feature = "redis")]
    pub redis: RedisConfig,
    /// Limits enforced by the admission middleware.
    pub rate_limit: RateLimitSettings,
    /// Limits of the agent quota API.
    pub agent_quota: LimitConfig,
}

/// Middleware settings from `RATE_LIMIT_*`.
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub limit: LimitConfig,
    pub key_prefix: String,
    pub trust_proxy: bool,
    pub fail_closed: bool,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: LimitConfig::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            trust_proxy: false,
            fail_closed: false,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            #[cfg(feature = "redis")]
            redis: RedisConfig::default(),
            rate_limit: RateLimitSettings::default(),
            agent_quota: LimitConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable or out-of-range bucket parameters are rejected.
    pub fn from_env() -> Result<Self, BucketError> {
        let rate_limit = RateLimitSettings {
            limit: LimitConfig::new(
                parse_var("RATE_LIMIT_CAPACITY", 100.0)?,
                parse_var("RATE_LIMIT_RATE", 10.0)?,
                parse_var("RATE_LIMIT_TOKENS_PER_REQUEST", 1.0)?,
            )?,
            key_prefix: env::var("RATE_LIMIT_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
            trust_proxy: flag("RATE_LIMIT_TRUST_PROXY"),
            fail_closed: flag("RATE_LIMIT_FAIL_CLOSED"),
        };

        let agent_quota = LimitConfig::new(
            parse_var("TOKEN_BUCKET_CAPACITY", 100.0)?,
            parse_var("TOKEN_BUCKET_RATE", 10.0)?,
            1.0,
        )?;

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            #[cfg(feature = "redis")]
            redis: RedisConfig::from_env(),
            rate_limit,
            agent_quota,
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, BucketError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            BucketError::InvalidConfiguration(format!("{name} is not a valid number: {raw:?}"))
        }),
        Err(_) => Ok(default),
    }
}

fn flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}
