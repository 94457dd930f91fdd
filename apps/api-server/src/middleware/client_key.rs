//! Caller identification for rate limit keys.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use actix_http::BoxedPayloadStream;
use actix_web::{
    dev::{Payload, ServiceRequest},
    error::PayloadError,
    http::header::{self, HeaderMap},
    HttpMessage,
    web,
};
use futures::{StreamExt, stream};
use sha2::{Digest, Sha256};

/// Body/query/route field carrying an agent identifier.
pub const AGENT_ID_FIELD: &str = "agentId";
/// Header carrying an agent identifier.
pub const AGENT_ID_HEADER: &str = "x-agent-id";

/// Largest JSON body inspected for an agent id; larger bodies pass untouched.
pub const MAX_AGENT_BODY_BYTES: usize = 64 * 1024;

const FORWARDED_FOR: &str = "x-forwarded-for";
const UNKNOWN: &str = "unknown";

/// Custom key extraction function.
pub type KeyFn = Arc<dyn Fn(&ServiceRequest) -> String + Send + Sync>;

/// How a request is mapped to a bucket identifier.
#[derive(Clone)]
pub enum KeyStrategy {
    /// Trusted address, forwarded-for, peer address, then a header fingerprint.
    Fingerprint { trust_proxy: bool },
    /// Trusted or peer address, else the shared literal `unknown`.
    IpOnly { trust_proxy: bool },
    /// Agent id from body, route, header or query; falls back to `Fingerprint`.
    Agent { trust_proxy: bool },
    Custom(KeyFn),
}

impl Default for KeyStrategy {
    fn default() -> Self {
        KeyStrategy::Fingerprint { trust_proxy: false }
    }
}

impl std::fmt::Debug for KeyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyStrategy::Fingerprint { trust_proxy } => f
                .debug_struct("Fingerprint")
                .field("trust_proxy", trust_proxy)
                .finish(),
            KeyStrategy::IpOnly { trust_proxy } => f
                .debug_struct("IpOnly")
                .field("trust_proxy", trust_proxy)
                .finish(),
            KeyStrategy::Agent { trust_proxy } => f
                .debug_struct("Agent")
                .field("trust_proxy", trust_proxy)
                .finish(),
            KeyStrategy::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Resolve the bucket identifier for `req`.
///
/// Takes the request mutably because the agent strategy may need to read the
/// body; the body is put back before the request moves on.
pub async fn identify(req: &mut ServiceRequest, strategy: &KeyStrategy) -> String {
    match strategy {
        KeyStrategy::Fingerprint { trust_proxy } => client_identity(req, *trust_proxy),
        KeyStrategy::IpOnly { trust_proxy } => trusted_address(req, *trust_proxy)
            .or_else(|| peer_address(req))
            .unwrap_or_else(|| UNKNOWN.to_string()),
        KeyStrategy::Agent { trust_proxy } => match agent_id(req).await {
            Some(id) => id,
            None => client_identity(req, *trust_proxy),
        },
        KeyStrategy::Custom(key_fn) => key_fn(req),
    }
}

/// Address-based identity with a fingerprint fallback, so unidentifiable
/// clients do not all share one bucket.
fn client_identity(req: &ServiceRequest, trust_proxy: bool) -> String {
    trusted_address(req, trust_proxy)
        .or_else(|| forwarded_for(req.headers()))
        .or_else(|| peer_address(req))
        .unwrap_or_else(|| fingerprint(req.headers()))
}

fn trusted_address(req: &ServiceRequest, trust_proxy: bool) -> Option<String> {
    if !trust_proxy {
        return None;
    }
    let info = req.connection_info();
    info.realip_remote_addr().map(strip_port)
}

/// Leftmost entry of the `X-Forwarded-For` chain.
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(String::from)
}

fn peer_address(req: &ServiceRequest) -> Option<String> {
    req.peer_addr().map(|addr| addr.ip().to_string())
}

fn strip_port(addr: &str) -> String {
    addr.parse::<SocketAddr>()
        .map(|socket| socket.ip().to_string())
        .unwrap_or_else(|_| addr.to_string())
}

/// Stable hash of user-agent and language headers.
pub fn fingerprint(headers: &HeaderMap) -> String {
    let header_str = |name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    };

    let mut hasher = Sha256::new();
    hasher.update(header_str(header::USER_AGENT).as_bytes());
    hasher.update(b"|");
    hasher.update(header_str(header::ACCEPT_LANGUAGE).as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    format!("fp:{}", &digest[..16])
}

/// Agent id from JSON body, route parameter, header, then query string.
async fn agent_id(req: &mut ServiceRequest) -> Option<String> {
    if let Some(id) = agent_id_from_body(req).await {
        return Some(id);
    }

    let from_route = req
        .match_info()
        .get(AGENT_ID_FIELD)
        .or_else(|| req.match_info().get("agent_id"))
        .map(String::from);

    from_route
        .or_else(|| {
            req.headers()
                .get(AGENT_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
        })
        .or_else(|| {
            web::Query::<HashMap<String, String>>::from_query(req.query_string())
                .ok()
                .and_then(|q| q.get(AGENT_ID_FIELD).cloned())
        })
        .filter(|id| !id.trim().is_empty())
}

async fn agent_id_from_body(req: &mut ServiceRequest) -> Option<String> {
    let headers = req.headers();
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let declared_len = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if !is_json || declared_len.is_some_and(|len| len > MAX_AGENT_BODY_BYTES) {
        return None;
    }

    // Buffer up to the limit, then hand the handler what was read followed by
    // whatever is left of the stream.
    let mut rest = req.take_payload();
    let mut body = web::BytesMut::new();
    let mut complete = true;
    while let Some(chunk) = rest.next().await {
        match chunk {
            Ok(chunk) => {
                body.extend_from_slice(&chunk);
                if body.len() > MAX_AGENT_BODY_BYTES {
                    complete = false;
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Could not read body for agent id");
                complete = false;
                break;
            }
        }
    }
    let body = body.freeze();

    let id = if complete {
        serde_json::from_slice::<serde_json::Value>(&body)
            .ok()
            .and_then(|value| match value.get(AGENT_ID_FIELD)? {
                serde_json::Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    } else {
        None
    };

    req.set_payload(restore_payload(body, rest));
    id
}

fn restore_payload(read: web::Bytes, rest: Payload) -> Payload {
    let head = stream::iter((!read.is_empty()).then(|| Ok::<_, PayloadError>(read)));
    let stream: BoxedPayloadStream = Box::pin(head.chain(rest));
    Payload::from(stream)
}
