//! Health check endpoint.

use actix_web::{HttpResponse, web};
use irl_shared::dto::HealthResponse;

use crate::state::AppState;

/// Health check endpoint - returns server and store status.
///
/// GET /api/health
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let timestamp = chrono::Utc::now().to_rfc3339();

    match state.store.ping().await {
        Ok(()) => HttpResponse::Ok().json(HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp,
            store: "connected".to_string(),
        }),
        Err(e) => {
            tracing::warn!(error = %e, "Health check: bucket store unreachable");
            HttpResponse::ServiceUnavailable().json(HealthResponse {
                status: "error".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                timestamp,
                store: "disconnected".to_string(),
            })
        }
    }
}
