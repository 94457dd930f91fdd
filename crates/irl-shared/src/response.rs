//! Standardized API error bodies (RFC 7807 for failures, plus the denial payload).

use serde::{Deserialize, Serialize};

/// Machine-readable reason carried by every rate limit denial.
pub const RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";

/// RFC 7807 Problem Details for HTTP APIs.
///
/// See: https://datatracker.ietf.org/doc/html/rfc7807
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// A URI reference that identifies the problem type.
    #[serde(rename = "type")]
    pub error_type: String,

    /// A short, human-readable summary of the problem type.
    pub title: String,

    /// The HTTP status code.
    pub status: u16,

    /// A human-readable explanation specific to this occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// A URI reference that identifies the specific occurrence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ErrorResponse {
    pub fn new(status: u16, title: impl Into<String>) -> Self {
        Self {
            error_type: "about:blank".to_string(),
            title: title.into(),
            status,
            detail: None,
            instance: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    // Common error constructors
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(400, "Bad Request").with_detail(detail)
    }

    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }

    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(503, "Service Unavailable").with_detail(detail)
    }
}

/// Body of a 429 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitedResponse {
    pub error: String,
    pub reason: String,
    pub message: String,
    /// Seconds to wait before retrying; `null` when waiting will never help.
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
}

impl RateLimitedResponse {
    pub fn new(retry_after: Option<u64>) -> Self {
        let message = match retry_after {
            Some(_) => "Rate limit exceeded. Please try again later.",
            None => "Rate limit exceeded. This quota does not refill.",
        };
        Self {
            error: "Too Many Requests".to_string(),
            reason: RATE_LIMIT_EXCEEDED.to_string(),
            message: message.to_string(),
            retry_after,
            remaining: None,
        }
    }

    pub fn with_remaining(mut self, remaining: u64) -> Self {
        self.remaining = Some(remaining);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_payload_shape() {
        let json = serde_json::to_value(RateLimitedResponse::new(Some(3))).unwrap();
        assert_eq!(json["reason"], RATE_LIMIT_EXCEEDED);
        assert_eq!(json["retryAfter"], 3);
        assert!(json.get("remaining").is_none());

        let json = serde_json::to_value(RateLimitedResponse::new(None).with_remaining(0)).unwrap();
        assert!(json["retryAfter"].is_null());
        assert_eq!(json["remaining"], 0);
    }

    #[test]
    fn test_problem_details_shape() {
        let json = serde_json::to_value(ErrorResponse::bad_request("agentId is required")).unwrap();
        assert_eq!(json["type"], "about:blank");
        assert_eq!(json["status"], 400);
        assert_eq!(json["detail"], "agentId is required");
        assert!(json.get("instance").is_none());
    }
}
