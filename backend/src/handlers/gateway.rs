//! Gateway operator endpoints.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::state::GatewayState;

/// Aggregated upstream health. Always 200; probes inform, they do not gate.
pub async fn gateway_health(State(state): State<GatewayState>) -> Json<Value> {
    let upstreams = state.health.snapshot();
    let status = if state.health.all_healthy() {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "service": "gateway",
        "status": status,
        "upstreams": upstreams,
    }))
}

pub async fn gateway_metrics(State(state): State<GatewayState>) -> Json<Value> {
    let mut metrics = state.metrics.snapshot();
    metrics["rate_limit_windows"] = json!(state.limiter.tracked_windows());
    Json(metrics)
}

/// Sanitized configuration echo for operators.
pub async fn gateway_config(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "authn_base_url": state.config.authn_base_url,
        "authz_base_url": state.config.authz_base_url,
        "upstream_timeout_secs": state.config.upstream_timeout_secs,
        "dev_fallback": state.config.dev_fallback,
        "rate_limit_max_requests": state.config.rate_limit_max_requests,
        "rate_limit_window_secs": state.config.rate_limit_window_secs,
        "health_probe_interval_secs": state.config.health_probe_interval_secs,
    }))
}
