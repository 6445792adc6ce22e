//! Authenticated reverse-proxy dispatch: the gateway's per-request pipeline.
//!
//! Order per request: rate-limit admission, caller validation, admin
//! authorization, then forwarding. Everything fails closed except the single
//! configured authorize endpoint.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use rand::Rng;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::AppError;
use crate::gateway::client::UpstreamError;
use crate::gateway::metrics::GatewayMetrics;
use crate::gateway::routes::{self, RouteDecision, Upstream};
use crate::middleware::request_context::RequestId;
use crate::models::decision::DecisionEffect;
use crate::state::GatewayState;

/// Upper bound on buffered request bodies; larger payloads are rejected.
const MAX_FORWARD_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Headers that only describe one hop and must not be forwarded either way.
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|hop| hop.eq_ignore_ascii_case(name))
}

pub async fn dispatch(State(state): State<GatewayState>, req: Request) -> Response {
    match dispatch_inner(&state, req).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn dispatch_inner(state: &GatewayState, req: Request) -> Result<Response, AppError> {
    GatewayMetrics::incr(&state.metrics.requests_total);

    let path = req.uri().path().to_string();
    let route = routes::resolve(&path)
        .ok_or_else(|| AppError::NotFound(format!("No route for {path}")))?;

    // 1. Rate-limit admission.
    let caller_key = caller_key(&req);
    let bucket = routes::route_bucket(&path);
    if let Err(retry_after) = state.limiter.check(&caller_key, bucket) {
        GatewayMetrics::incr(&state.metrics.rate_limited);
        return Err(AppError::RateLimited {
            message: "Too many requests. Please try again later.".to_string(),
            retry_after,
        });
    }

    // 2. Caller identity.
    let bearer = bearer_token(req.headers()).map(str::to_string);
    let mut caller = None;
    if route.requires_auth {
        let Some(token) = bearer.as_deref() else {
            GatewayMetrics::incr(&state.metrics.auth_failures);
            return Err(AppError::Unauthorized(
                "Authentication required".to_string(),
            ));
        };
        match state.clients.validate(token).await {
            Ok(validated) if validated.valid => caller = Some(validated),
            Ok(_) => {
                GatewayMetrics::incr(&state.metrics.auth_failures);
                return Err(AppError::Unauthorized(
                    "Invalid or expired token".to_string(),
                ));
            }
            Err(UpstreamError::Unavailable(detail)) => {
                GatewayMetrics::incr(&state.metrics.upstream_errors);
                tracing::warn!(detail = %detail, "Authentication upstream unavailable");
                return Err(AppError::Unavailable(
                    "Authentication service unavailable".to_string(),
                ));
            }
        }
    }

    // 3. Admin authorization. Fail-closed: the fail-open rule never applies
    // to the control-plane check itself.
    if let Some(resource) = route.admin_resource {
        let caller = caller
            .as_ref()
            .expect("admin-gated routes always require authentication");
        let action = req.method().as_str().to_ascii_lowercase();
        match state
            .clients
            .authorize_admin(caller, resource, &action, &path)
            .await
        {
            Ok(decision) if decision.effect == DecisionEffect::Permit => {}
            Ok(_) => {
                GatewayMetrics::incr(&state.metrics.authz_denials);
                return Err(AppError::Forbidden(
                    "Insufficient permission".to_string(),
                ));
            }
            Err(UpstreamError::Unavailable(detail)) => {
                GatewayMetrics::incr(&state.metrics.upstream_errors);
                tracing::warn!(detail = %detail, "Authorization upstream unavailable");
                return Err(AppError::Unavailable(
                    "Authorization service unavailable".to_string(),
                ));
            }
        }
    }

    // 4. Forward.
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    match forward(state, &route, req).await {
        Ok(response) => {
            match route.upstream {
                Upstream::Authn => GatewayMetrics::incr(&state.metrics.forwarded_authn),
                Upstream::Authz => GatewayMetrics::incr(&state.metrics.forwarded_authz),
            }
            Ok(response)
        }
        Err(ForwardError::Client(err)) => Err(err),
        Err(ForwardError::Upstream(detail)) => {
            GatewayMetrics::incr(&state.metrics.upstream_errors);
            tracing::warn!(detail = %detail, path = %path, "Upstream forward failed");
            if route.is_authorize_endpoint && state.config.dev_fallback {
                GatewayMetrics::incr(&state.metrics.fallback_permits);
                tracing::warn!("Authorize fail-open engaged (development fallback)");
                return Ok(fallback_permit_response(&request_id));
            }
            Err(AppError::Unavailable(
                "Upstream service unavailable".to_string(),
            ))
        }
    }
}

enum ForwardError {
    Client(AppError),
    Upstream(String),
}

async fn forward(
    state: &GatewayState,
    route: &RouteDecision,
    req: Request,
) -> Result<Response, ForwardError> {
    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, MAX_FORWARD_BODY_BYTES)
        .await
        .map_err(|_| {
            ForwardError::Client(AppError::BadRequest("Request body too large".to_string()))
        })?;

    let base = state.clients.base_url(route.upstream);
    let url = match parts.uri.query() {
        Some(query) => format!("{base}{}?{query}", route.forward_path),
        None => format!("{base}{}", route.forward_path),
    };

    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|_| ForwardError::Client(AppError::BadRequest("Invalid method".to_string())))?;

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        let name_str = name.as_str();
        // Host is rewritten by the client; length is recomputed for the
        // buffered body.
        if is_hop_by_hop(name_str) || name_str == "host" || name_str == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name_str.as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let timeout = state.config.upstream_timeout();
    let mut last_error = String::new();
    for attempt in 0..2 {
        if attempt > 0 {
            // One transparent retry with jittered backoff.
            let jitter = rand::thread_rng().gen_range(50..150);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let result = state
            .clients
            .http()
            .request(method.clone(), &url)
            .headers(headers.clone())
            .body(body_bytes.clone())
            .timeout(timeout)
            .send()
            .await;

        match result {
            Ok(upstream_response) => {
                return build_response(upstream_response).await.map_err(ForwardError::Upstream)
            }
            Err(err) if attempt == 0 && (err.is_connect() || err.is_timeout()) => {
                last_error = err.to_string();
                continue;
            }
            Err(err) => return Err(ForwardError::Upstream(err.to_string())),
        }
    }
    Err(ForwardError::Upstream(last_error))
}

/// Rebuilds the upstream response verbatim, minus hop-by-hop headers.
async fn build_response(upstream: reqwest::Response) -> Result<Response, String> {
    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

    let mut headers = HeaderMap::new();
    for (name, value) in upstream.headers().iter() {
        let name_str = name.as_str();
        if is_hop_by_hop(name_str) || name_str == "content-length" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            header::HeaderName::from_bytes(name_str.as_bytes()),
            header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.append(name, value);
        }
    }

    let body = upstream.bytes().await.map_err(|e| e.to_string())?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

/// Synthetic permit for the single fail-open route.
fn fallback_permit_response(request_id: &str) -> Response {
    let body = json!({
        "decision": {
            "fingerprint": "",
            "effect": "permit",
            "reason": "development fallback - authorization service unreachable",
            "matched_policies": [],
            "evaluation_ms": 0.0,
            "cache_hit": false,
            "obligations": [],
            "advice": [],
            "timestamp": Utc::now(),
            "request_id": request_id,
        }
    });
    (StatusCode::OK, Json(body)).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

/// Rate-limit key: the bearer credential when present (stable per caller),
/// else the peer or forwarded-for address.
fn caller_key(req: &Request) -> String {
    if let Some(token) = bearer_token(req.headers()) {
        return format!("token:{token}");
    }
    let forwarded = req
        .headers()
        .get("x-forwarded-for")
        .or_else(|| req.headers().get("x-real-ip"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.split(',').next().unwrap_or(value).trim().to_string());
    if let Some(ip) = forwarded {
        return format!("ip:{ip}");
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| format!("ip:{}", info.0.ip()))
        .unwrap_or_else(|| "ip:unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn hop_by_hop_headers_are_recognized() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(!is_hop_by_hop("authorization"));
        assert!(!is_hop_by_hop("content-type"));
    }

    #[tokio::test]
    async fn fallback_response_is_a_development_permit() {
        let response = fallback_permit_response("req-9");
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["decision"]["effect"], "permit");
        assert!(value["decision"]["reason"]
            .as_str()
            .unwrap()
            .contains("development fallback"));
        assert_eq!(value["decision"]["cache_hit"], false);
    }

    #[test]
    fn caller_key_prefers_bearer_then_forwarded_for() {
        let req = Request::builder()
            .uri("/api/v1/auth/login")
            .header("authorization", "Bearer abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(caller_key(&req), "token:abc123");

        let req = Request::builder()
            .uri("/api/v1/auth/login")
            .header("x-forwarded-for", "203.0.113.1, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(caller_key(&req), "ip:203.0.113.1");

        let req = Request::builder()
            .uri("/api/v1/auth/login")
            .body(Body::empty())
            .unwrap();
        assert_eq!(caller_key(&req), "ip:unknown");
    }
}
