//! HTTP handlers and route configuration.

mod demo;
mod health;
mod quota;

use actix_web::web;

use crate::middleware::error::AppError;
use crate::middleware::rate_limit::RateLimitMiddleware;
use crate::state::AppState;

/// Configure all application routes.
pub fn configure_routes(cfg: &mut web::ServiceConfig, state: &AppState) {
    let address_limit =
        || RateLimitMiddleware::new(state.limiter.clone(), state.address_policy.clone());
    let agent_limit =
        || RateLimitMiddleware::new(state.limiter.clone(), state.agent_policy.clone());

    cfg.app_data(json_config()).service(
        web::scope("/api")
            // Public routes
            .route("/health", web::get().to(health::health_check))
            // Agent quota API
            .route("/request", web::post().to(quota::request_access))
            .route("/quota/{agentId}", web::get().to(quota::quota))
            // Middleware-protected routes
            .service(
                web::resource("/test")
                    .wrap(address_limit())
                    .route(web::get().to(demo::test_endpoint)),
            )
            .service(
                web::resource("/agents/{agentId}/ping")
                    .wrap(agent_limit())
                    .route(web::get().to(demo::agent_ping)),
            )
            .service(
                web::resource("/agents/ping")
                    .wrap(agent_limit())
                    .route(web::post().to(demo::agent_ping_body)),
            ),
    );
}

/// Malformed JSON bodies answer with a problem details 400.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use actix_web::{App, http::StatusCode, test};
    use async_trait::async_trait;
    use irl_core::domain::{BucketRequest, ConsumeOutcome, LimitConfig};
    use irl_core::ports::{BucketStore, StoreError};
    use irl_infra::InMemoryBucketStore;
    use serde_json::{Value, json};

    use crate::config::AppConfig;

    struct UnreachableStore;

    #[async_trait]
    impl BucketStore for UnreachableStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
            Err(StoreError::Timeout(1000))
        }

        async fn set_ex(&self, _key: &str, _value: &str, _ttl: u64) -> Result<(), StoreError> {
            Err(StoreError::Timeout(1000))
        }

        async fn consume(
            &self,
            _key: &str,
            _request: BucketRequest,
        ) -> Result<ConsumeOutcome, StoreError> {
            Err(StoreError::Timeout(1000))
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Err(StoreError::Timeout(1000))
        }
    }

    fn config(capacity: f64, rate: f64) -> AppConfig {
        let mut config = AppConfig::default();
        config.agent_quota = LimitConfig::new(capacity, rate, 1.0).unwrap();
        config.rate_limit.limit = LimitConfig::new(capacity, rate, 1.0).unwrap();
        config
    }

    fn state(config: &AppConfig, store: Arc<dyn BucketStore>) -> AppState {
        AppState::with_store(config, store).unwrap()
    }

    macro_rules! app {
        ($state:expr) => {{
            let state = $state;
            test::init_service(
                App::new()
                    .app_data(web::Data::new(state.clone()))
                    .configure(|cfg| configure_routes(cfg, &state)),
            )
            .await
        }};
    }

    fn consume(agent_id: &str, tokens: f64) -> actix_http::Request {
        test::TestRequest::post()
            .uri("/api/request")
            .set_json(json!({ "agentId": agent_id, "tokens": tokens }))
            .to_request()
    }

    #[actix_web::test]
    async fn test_health_reports_store() {
        let app = app!(state(&config(10.0, 1.0), Arc::new(InMemoryBucketStore::new())));
        let req = test::TestRequest::get().uri("/api/health").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["store"], "connected");

        let app = app!(state(&config(10.0, 1.0), Arc::new(UnreachableStore)));
        let req = test::TestRequest::get().uri("/api/health").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["store"], "disconnected");
    }

    #[actix_web::test]
    async fn test_request_consumes_then_denies() {
        let app = app!(state(&config(3.0, 0.0), Arc::new(InMemoryBucketStore::new())));

        let res = test::call_service(&app, consume("agent-1", 2.0)).await;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            res.headers().get("x-ratelimit-remaining").unwrap(),
            "1"
        );
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["tokensConsumed"], 2.0);
        assert_eq!(body["remaining"], 1);
        assert_eq!(body["limit"], 3.0);

        let res = test::call_service(&app, consume("agent-1", 2.0)).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(res.headers().get("retry-after").is_none());
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["reason"], "rate_limit_exceeded");
        assert_eq!(body["remaining"], 1);
        assert!(body["retryAfter"].is_null());

        // Denial consumed nothing.
        let res = test::call_service(&app, consume("agent-1", 1.0)).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_request_denial_sets_retry_after() {
        let app = app!(state(&config(1.0, 2.0), Arc::new(InMemoryBucketStore::new())));

        test::call_service(&app, consume("agent-2", 1.0)).await;
        let res = test::call_service(&app, consume("agent-2", 1.0)).await;
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(res.headers().get("retry-after").unwrap(), "1");
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["retryAfter"], 1);
    }

    #[actix_web::test]
    async fn test_request_validation() {
        let app = app!(state(&config(10.0, 1.0), Arc::new(InMemoryBucketStore::new())));

        for payload in [
            json!({ "tokens": 1 }),
            json!({ "agentId": "  " }),
            json!({ "agentId": "a", "tokens": 0.5 }),
            json!({ "agentId": "a", "tokens": -3 }),
            json!({ "agentId": 42 }),
        ] {
            let req = test::TestRequest::post()
                .uri("/api/request")
                .set_json(payload.clone())
                .to_request();
            let res = test::call_service(&app, req).await;
            assert_eq!(res.status(), StatusCode::BAD_REQUEST, "payload: {payload}");
            let body: Value = test::read_body_json(res).await;
            assert_eq!(body["status"], 400);
        }
    }

    #[actix_web::test]
    async fn test_request_fails_open_when_store_down() {
        let app = app!(state(&config(10.0, 1.0), Arc::new(UnreachableStore)));
        let res = test::call_service(&app, consume("agent-3", 1.0)).await;
        assert_eq!(res.status(), StatusCode::OK);
        let body: Value = test::read_body_json(res).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["degraded"], true);
    }

    #[actix_web::test]
    async fn test_quota_lifecycle() {
        let store = Arc::new(InMemoryBucketStore::new());
        let app = app!(state(&config(5.0, 0.0), store.clone()));

        let req = test::TestRequest::get().uri("/api/quota/agent-4").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["agentId"], "agent-4");
        assert_eq!(body["status"], "new");
        assert_eq!(body["remaining"], 5);
        assert!(body["message"].is_string());

        test::call_service(&app, consume("agent-4", 2.0)).await;

        // Inspection never consumes.
        for _ in 0..2 {
            let req = test::TestRequest::get().uri("/api/quota/agent-4").to_request();
            let body: Value = test::call_and_read_body_json(&app, req).await;
            assert_eq!(body["status"], "active");
            assert_eq!(body["remaining"], 3);
            assert!(body["lastActivity"].is_string());
        }

        store
            .set_ex("ratelimit:agent:agent-5", "not a bucket", 60)
            .await
            .unwrap();
        let req = test::TestRequest::get().uri("/api/quota/agent-5").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "reset");
        assert_eq!(body["remaining"], 5);
    }

    #[actix_web::test]
    async fn test_quota_unavailable_when_store_down() {
        let app = app!(state(&config(10.0, 1.0), Arc::new(UnreachableStore)));
        let req = test::TestRequest::get().uri("/api/quota/agent-6").to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[actix_web::test]
    async fn test_protected_routes() {
        let app = app!(state(&config(1.0, 0.0), Arc::new(InMemoryBucketStore::new())));

        let get = |uri: &str| {
            test::TestRequest::get()
                .uri(uri)
                .insert_header(("x-forwarded-for", "198.51.100.20"))
                .to_request()
        };

        assert_eq!(test::call_service(&app, get("/api/test")).await.status(), StatusCode::OK);
        assert_eq!(
            test::call_service(&app, get("/api/test")).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );

        // Agent routes use their own buckets.
        assert_eq!(
            test::call_service(&app, get("/api/agents/x/ping")).await.status(),
            StatusCode::OK
        );
        assert_eq!(
            test::call_service(&app, get("/api/agents/x/ping")).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );

        let req = test::TestRequest::post()
            .uri("/api/agents/ping")
            .set_json(json!({ "agentId": "y" }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["agentId"], "y");
        assert_eq!(body["message"], "pong");
    }
}
