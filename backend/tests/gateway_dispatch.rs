//! Gateway pipeline tests against in-process fake upstreams.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use palisade_backend::{
    config::GatewayConfig,
    gateway::client::UpstreamClients,
    gateway::health::HealthRegistry,
    gateway::metrics::GatewayMetrics,
    gateway::proxy::dispatch,
    middleware::rate_limit::SlidingWindowLimiter,
    middleware::request_context::request_context,
    state::GatewayState,
};

async fn spawn_app(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve fake upstream");
    });
    format!("http://{addr}")
}

/// A loopback address nothing listens on.
fn dead_base_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe listener");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

fn fake_authn(valid: bool, roles: Vec<&'static str>) -> Router {
    Router::new()
        .route(
            "/auth/validate",
            get(move || {
                let roles = roles.clone();
                async move {
                    if valid {
                        Json(json!({
                            "valid": true,
                            "subject": "user-1",
                            "username": "admin",
                            "roles": roles,
                            "scopes": [],
                            "exp": 4_102_444_800i64,
                        }))
                        .into_response()
                    } else {
                        StatusCode::UNAUTHORIZED.into_response()
                    }
                }
            }),
        )
        .route(
            "/auth/login",
            post(|| async { Json(json!({"access_token": "issued-by-authn"})) }),
        )
}

fn decision_body(effect: &str) -> Value {
    json!({
        "decision": {
            "fingerprint": "fp-test",
            "effect": effect,
            "reason": "test decision",
            "matched_policies": [],
            "evaluation_ms": 0.1,
            "cache_hit": false,
            "obligations": [],
            "advice": [],
            "timestamp": "2025-06-01T00:00:00Z",
            "request_id": "req-test",
        }
    })
}

fn fake_authz(effect: &'static str) -> Router {
    Router::new()
        .route(
            "/authorize",
            post(move || async move { Json(decision_body(effect)) }),
        )
        .route(
            "/policies",
            get(|| async { Json(json!([{"id": "p-1"}])) }),
        )
}

fn gateway_config(authn_base: String, authz_base: String, dev_fallback: bool) -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".into(),
        port: 8000,
        workers: None,
        authn_base_url: authn_base,
        authz_base_url: authz_base,
        upstream_timeout_secs: 5,
        dev_fallback,
        rate_limit_max_requests: 100,
        rate_limit_window_secs: 60,
        login_ip_max_requests: 100,
        login_ip_window_secs: 60,
        health_probe_interval_secs: 60,
    }
}

fn gateway_app(config: GatewayConfig) -> Router {
    let client = reqwest::Client::new();
    let clients = Arc::new(UpstreamClients::new(client, &config));
    let limiter = Arc::new(SlidingWindowLimiter::from_config(&config));
    let state = GatewayState::new(
        config,
        clients,
        limiter,
        Arc::new(HealthRegistry::default()),
        Arc::new(GatewayMetrics::default()),
    );
    Router::new()
        .fallback(dispatch)
        .layer(axum_middleware::from_fn(request_context))
        .with_state(state)
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

#[tokio::test]
async fn public_login_route_forwards_to_authn() {
    let authn = spawn_app(fake_authn(true, vec!["user"])).await;
    let authz = spawn_app(fake_authz("permit")).await;
    let app = gateway_app(gateway_config(authn, authz, false));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/auth/login")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"username":"admin","password":"admin123"}"#))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["access_token"], "issued-by-authn");
}

#[tokio::test]
async fn protected_route_without_token_is_unauthorized() {
    let authn = spawn_app(fake_authn(true, vec!["user"])).await;
    let authz = spawn_app(fake_authz("permit")).await;
    let app = gateway_app(gateway_config(authn, authz, false));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/users/me")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], 401);
    assert_eq!(body["error"]["path"], "/api/v1/users/me");
}

#[tokio::test]
async fn invalid_token_is_rejected_by_the_gateway() {
    let authn = spawn_app(fake_authn(false, vec![])).await;
    let authz = spawn_app(fake_authz("permit")).await;
    let app = gateway_app(gateway_config(authn, authz, false));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/users/me")
                .header("authorization", "Bearer expired-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_route_forwards_when_authz_permits() {
    let authn = spawn_app(fake_authn(true, vec!["admin", "user"])).await;
    let authz = spawn_app(fake_authz("permit")).await;
    let app = gateway_app(gateway_config(authn, authz, false));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/authz/policies")
                .header("authorization", "Bearer admin-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body[0]["id"], "p-1");
}

#[tokio::test]
async fn admin_route_is_forbidden_on_deny() {
    let authn = spawn_app(fake_authn(true, vec!["user"])).await;
    let authz = spawn_app(fake_authz("deny")).await;
    let app = gateway_app(gateway_config(authn, authz, false));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/authz/policies")
                .header("authorization", "Bearer user-token")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn authorize_fails_open_only_with_fallback_enabled() {
    let authn = spawn_app(fake_authn(true, vec!["admin", "user"])).await;
    let dead_authz = dead_base_url();
    let app = gateway_app(gateway_config(authn, dead_authz, true));

    // The data-plane authorize endpoint fails open...
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/authz/authorize")
                .header("authorization", "Bearer admin-token")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"subject":{"id":"user-1"},"resource":"doc1","action":"read"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["decision"]["effect"], "permit");
    assert!(body["decision"]["reason"]
        .as_str()
        .unwrap()
        .contains("development fallback"));

    // ...while every other authz route stays fail-closed.
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/authz/policies")
                .header("authorization", "Bearer admin-token")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"effect":"permit"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn authorize_fails_closed_without_fallback() {
    let authn = spawn_app(fake_authn(true, vec!["user"])).await;
    let dead_authz = dead_base_url();
    let app = gateway_app(gateway_config(authn, dead_authz, false));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/authz/authorize")
                .header("authorization", "Bearer user-token")
                .header("content-type", "application/json")
                .body(Body::from(
                    r#"{"subject":{"id":"user-1"},"resource":"doc1","action":"read"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unmatched_path_is_not_found() {
    let authn = spawn_app(fake_authn(true, vec!["user"])).await;
    let authz = spawn_app(fake_authz("permit")).await;
    let app = gateway_app(gateway_config(authn, authz, false));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/unknown/path")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], 404);
}

#[tokio::test]
async fn rate_limit_rejects_with_retry_after() {
    let authn = spawn_app(fake_authn(true, vec!["user"])).await;
    let authz = spawn_app(fake_authz("permit")).await;
    let mut config = gateway_config(authn, authz, false);
    config.rate_limit_max_requests = 1;
    let app = gateway_app(config);

    let request = || {
        Request::builder()
            .method("POST")
            .uri("/api/v1/auth/login")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"username":"a","password":"b"}"#))
            .unwrap()
    };

    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().get("retry-after").is_some());
    let body = body_json(second).await;
    assert_eq!(body["error"]["code"], 429);
}
