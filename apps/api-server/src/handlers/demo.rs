//! Routes that exist to exercise the admission middleware.

use actix_web::{HttpResponse, web};
use serde_json::json;

use crate::middleware::client_key::AGENT_ID_FIELD;

/// GET /api/test
pub async fn test_endpoint() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Request allowed",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

/// GET /api/agents/{agentId}/ping
pub async fn agent_ping(path: web::Path<String>) -> HttpResponse {
    HttpResponse::Ok().json(json!({ "agentId": path.into_inner(), "message": "pong" }))
}

/// POST /api/agents/ping
pub async fn agent_ping_body(body: web::Json<serde_json::Value>) -> HttpResponse {
    let agent_id = body.get(AGENT_ID_FIELD).cloned().unwrap_or_default();
    HttpResponse::Ok().json(json!({ "agentId": agent_id, "message": "pong" }))
}
