//! Rate limiting middleware.

use actix_web::{
    Error, HttpRequest, HttpResponse,
    body::EitherBody,
    dev::{Service, ServiceRequest, ServiceResponse, Transform, forward_ready},
    http::header::{HeaderMap, HeaderName, HeaderValue},
};
use futures::future::LocalBoxFuture;
use irl_shared::{ErrorResponse, RateLimitedResponse};
use std::future::{Ready, ready};
use std::rc::Rc;
use std::sync::Arc;

use irl_core::BucketError;
use irl_core::domain::LimitConfig;
use irl_core::ports::{RateLimitDecision, RateLimiter};
use irl_core::service::bucket_key;

use super::client_key::{self, KeyFn, KeyStrategy};

/// Default key prefix for address-keyed buckets.
pub const DEFAULT_KEY_PREFIX: &str = "ratelimit:middleware";
/// Default key prefix for agent-keyed buckets.
pub const AGENT_KEY_PREFIX: &str = "ratelimit:agent";

/// Per-request skip predicate.
pub type SkipFn = Arc<dyn Fn(&ServiceRequest) -> bool + Send + Sync>;
/// Builds the response for a denied request.
pub type RejectFn = Arc<dyn Fn(&HttpRequest, &RateLimitDecision) -> HttpResponse + Send + Sync>;

/// What to do when the limiter cannot reach its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Let the request through.
    #[default]
    Open,
    /// Answer 503.
    Closed,
}

/// Rate limit policy for one route or scope.
#[derive(Clone)]
pub struct RateLimitPolicy {
    pub limit: LimitConfig,
    pub key_prefix: String,
    pub key_strategy: KeyStrategy,
    pub skip: Option<SkipFn>,
    pub on_limited: RejectFn,
    pub failure: FailurePolicy,
}

impl RateLimitPolicy {
    pub fn builder() -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder::default()
    }

    /// Agent-keyed policy: buckets are keyed by agent id when the request
    /// carries one, by client identity otherwise.
    pub fn agent_builder() -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder::default()
            .key_prefix(AGENT_KEY_PREFIX)
            .key_strategy(KeyStrategy::Agent { trust_proxy: false })
    }
}

impl std::fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitPolicy")
            .field("limit", &self.limit)
            .field("key_prefix", &self.key_prefix)
            .field("key_strategy", &self.key_strategy)
            .field("skip", &self.skip.is_some())
            .field("failure", &self.failure)
            .finish()
    }
}

/// Builder for [`RateLimitPolicy`].
pub struct RateLimitPolicyBuilder {
    limit: LimitConfig,
    key_prefix: String,
    key_strategy: KeyStrategy,
    skip: Option<SkipFn>,
    on_limited: RejectFn,
    failure: FailurePolicy,
}

impl Default for RateLimitPolicyBuilder {
    fn default() -> Self {
        Self {
            limit: LimitConfig::default(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            key_strategy: KeyStrategy::default(),
            skip: None,
            on_limited: Arc::new(too_many_requests),
            failure: FailurePolicy::Open,
        }
    }
}

impl RateLimitPolicyBuilder {
    pub fn limit(mut self, limit: LimitConfig) -> Self {
        self.limit = limit;
        self
    }

    pub fn capacity(mut self, capacity: f64) -> Self {
        self.limit.capacity = capacity;
        self
    }

    pub fn rate(mut self, rate: f64) -> Self {
        self.limit.rate = rate;
        self
    }

    pub fn tokens_per_request(mut self, tokens: f64) -> Self {
        self.limit.tokens_per_request = tokens;
        self
    }

    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    /// Honor `Forwarded`/`X-Forwarded-For` as the client address.
    pub fn trust_proxy(mut self, trust: bool) -> Self {
        self.key_strategy = match self.key_strategy {
            KeyStrategy::Fingerprint { .. } => KeyStrategy::Fingerprint { trust_proxy: trust },
            KeyStrategy::IpOnly { .. } => KeyStrategy::IpOnly { trust_proxy: trust },
            KeyStrategy::Agent { .. } => KeyStrategy::Agent { trust_proxy: trust },
            custom @ KeyStrategy::Custom(_) => custom,
        };
        self
    }

    pub fn key_fn<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(&ServiceRequest) -> String + Send + Sync + 'static,
    {
        let key_fn: KeyFn = Arc::new(key_fn);
        self.key_strategy = KeyStrategy::Custom(key_fn);
        self
    }

    pub fn skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&ServiceRequest) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    pub fn on_limited<F>(mut self, handler: F) -> Self
    where
        F: Fn(&HttpRequest, &RateLimitDecision) -> HttpResponse + Send + Sync + 'static,
    {
        self.on_limited = Arc::new(handler);
        self
    }

    pub fn failure_policy(mut self, failure: FailurePolicy) -> Self {
        self.failure = failure;
        self
    }

    /// Validate the bucket parameters.
    pub fn build(self) -> Result<RateLimitPolicy, BucketError> {
        self.limit.validate()?;
        Ok(RateLimitPolicy {
            limit: self.limit,
            key_prefix: self.key_prefix,
            key_strategy: self.key_strategy,
            skip: self.skip,
            on_limited: self.on_limited,
            failure: self.failure,
        })
    }
}

/// Default rejection: 429 with the structured denial payload.
pub fn too_many_requests(_req: &HttpRequest, decision: &RateLimitDecision) -> HttpResponse {
    HttpResponse::TooManyRequests().json(RateLimitedResponse::new(decision.retry_after_secs()))
}

/// Write the decision's rate limit headers onto a response.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    for (name, value) in decision.headers() {
        if let (Ok(name), Ok(value)) = (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            headers.insert(name, value);
        }
    }
}

/// Rate limiting middleware factory.
pub struct RateLimitMiddleware {
    limiter: Arc<dyn RateLimiter>,
    policy: Arc<RateLimitPolicy>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<dyn RateLimiter>, policy: RateLimitPolicy) -> Self {
        Self {
            limiter,
            policy: Arc::new(policy),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimitMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RateLimitMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RateLimitMiddlewareService {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            policy: self.policy.clone(),
        }))
    }
}

pub struct RateLimitMiddlewareService<S> {
    service: Rc<S>,
    limiter: Arc<dyn RateLimiter>,
    policy: Arc<RateLimitPolicy>,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, mut req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let limiter = self.limiter.clone();
        let policy = self.policy.clone();

        Box::pin(async move {
            if policy.skip.as_ref().is_some_and(|skip| skip(&req)) {
                let res = service.call(req).await?;
                return Ok(res.map_into_left_body());
            }

            let identifier = client_key::identify(&mut req, &policy.key_strategy).await;
            let key = bucket_key(&policy.key_prefix, &identifier);

            match limiter.check(&key, &policy.limit).await {
                Ok(decision) if decision.allowed => {
                    tracing::debug!(
                        identifier = %identifier,
                        path = %req.path(),
                        remaining = decision.remaining,
                        "Request allowed (middleware)"
                    );
                    let mut res = service.call(req).await?;
                    apply_rate_limit_headers(res.headers_mut(), &decision);
                    Ok(res.map_into_left_body())
                }
                Ok(decision) => {
                    tracing::info!(
                        identifier = %identifier,
                        path = %req.path(),
                        method = %req.method(),
                        remaining = decision.remaining,
                        retry_after_ms = decision.retry_after_ms,
                        "Rate limit exceeded (middleware)"
                    );
                    let (http_req, _payload) = req.into_parts();
                    let mut response = (policy.on_limited)(&http_req, &decision);
                    apply_rate_limit_headers(response.headers_mut(), &decision);
                    Ok(ServiceResponse::new(http_req, response).map_into_right_body())
                }
                Err(error) => match policy.failure {
                    FailurePolicy::Open => {
                        tracing::error!(
                            error = %error,
                            path = %req.path(),
                            "Rate limiter error - failing open"
                        );
                        let res = service.call(req).await?;
                        Ok(res.map_into_left_body())
                    }
                    FailurePolicy::Closed => {
                        tracing::error!(
                            error = %error,
                            path = %req.path(),
                            "Rate limiter error - failing closed"
                        );
                        let body = ErrorResponse::service_unavailable("Rate limiter unavailable")
                            .with_instance(req.path());
                        let (http_req, _payload) = req.into_parts();
                        let response = HttpResponse::ServiceUnavailable().json(body);
                        Ok(ServiceResponse::new(http_req, response).map_into_right_body())
                    }
                },
            }
        })
    }
}
