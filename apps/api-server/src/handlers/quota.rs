//! Agent quota API: consume on request, inspect without consuming.

use actix_web::{HttpResponse, web};
use irl_core::domain::{LimitConfig, QuotaStatus};
use irl_core::service::bucket_key;
use irl_shared::RateLimitedResponse;
use irl_shared::dto::{ConsumeRequest, ConsumeResponse, QuotaResponse};

use crate::middleware::error::{AppError, AppResult};
use crate::middleware::rate_limit::{AGENT_KEY_PREFIX, apply_rate_limit_headers};
use crate::state::AppState;

fn agent_key(agent_id: &str) -> String {
    bucket_key(AGENT_KEY_PREFIX, agent_id)
}

fn require_agent_id(agent_id: Option<&str>) -> AppResult<&str> {
    match agent_id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(AppError::BadRequest(
            "agentId is required and must be a non-empty string".to_string(),
        )),
    }
}

/// Consume tokens for an agent.
///
/// POST /api/request
pub async fn request_access(
    state: web::Data<AppState>,
    body: web::Json<ConsumeRequest>,
) -> AppResult<HttpResponse> {
    let agent_id = require_agent_id(body.agent_id.as_deref())?;
    let tokens = body.tokens;
    if !(tokens.is_finite() && tokens >= 1.0) {
        return Err(AppError::BadRequest(
            "tokens must be a number greater than or equal to 1".to_string(),
        ));
    }

    let config = LimitConfig {
        tokens_per_request: tokens,
        ..state.agent_quota
    };

    let decision = match state.limiter.check(&agent_key(agent_id), &config).await {
        Ok(decision) => decision,
        Err(e) => {
            tracing::error!(
                agent_id = %agent_id,
                error = %e,
                "Rate limiter error - allowing request"
            );
            return Ok(HttpResponse::Ok().json(ConsumeResponse {
                success: true,
                message: "Request allowed (rate limiter unavailable)".to_string(),
                tokens_consumed: tokens,
                remaining: None,
                limit: config.capacity,
                degraded: true,
            }));
        }
    };

    let mut response = if decision.allowed {
        tracing::debug!(
            agent_id = %agent_id,
            tokens_consumed = tokens,
            remaining = decision.remaining,
            "Request allowed"
        );
        HttpResponse::Ok().json(ConsumeResponse {
            success: true,
            message: "Request allowed".to_string(),
            tokens_consumed: tokens,
            remaining: Some(decision.remaining),
            limit: config.capacity,
            degraded: false,
        })
    } else {
        tracing::info!(
            agent_id = %agent_id,
            tokens_requested = tokens,
            remaining = decision.remaining,
            retry_after_ms = decision.retry_after_ms,
            "Rate limit exceeded"
        );
        HttpResponse::TooManyRequests().json(
            RateLimitedResponse::new(decision.retry_after_secs())
                .with_remaining(decision.remaining),
        )
    };

    apply_rate_limit_headers(response.headers_mut(), &decision);
    Ok(response)
}

/// Report an agent's quota without consuming tokens.
///
/// GET /api/quota/{agentId}
pub async fn quota(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let agent_id = require_agent_id(Some(path.as_str()))?;

    let snapshot = state
        .limiter
        .inspect(&agent_key(agent_id), &state.agent_quota)
        .await?;

    let message = match snapshot.status {
        QuotaStatus::New => Some("No requests made yet. Full quota available."),
        QuotaStatus::Reset => Some("Bucket data was unreadable. Reported as full quota."),
        QuotaStatus::Active => None,
    };

    Ok(HttpResponse::Ok().json(QuotaResponse {
        agent_id: agent_id.to_string(),
        remaining: snapshot.remaining,
        limit: snapshot.limit,
        rate: snapshot.rate,
        status: snapshot.status.as_str().to_string(),
        last_activity: snapshot.last_activity,
        message: message.map(String::from),
    }))
}
