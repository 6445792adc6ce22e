//! Authorization service endpoints: decisions, admin, and audit queries.

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::AppError,
    middleware::request_context::RequestId,
    models::audit::{AuditQuery, AuditRecord, SecurityAlert},
    models::decision::{
        AuthorizeRequest, BulkAuthorizeRequest, BulkAuthorizeResponse, DecisionResponse,
    },
    repositories::audit as audit_repo,
    state::AuthzState,
    types::SecurityAlertId,
};

fn request_id(extension: Option<&RequestId>) -> String {
    extension
        .map(|id| id.0.clone())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

pub async fn authorize(
    State(state): State<AuthzState>,
    request_ctx: Option<Extension<RequestId>>,
    Json(payload): Json<AuthorizeRequest>,
) -> Result<Json<DecisionResponse>, AppError> {
    let request_id = request_id(request_ctx.as_deref());
    let decision = state.engine.authorize(&payload, &request_id).await?;
    Ok(Json(DecisionResponse { decision }))
}

pub async fn authorize_bulk(
    State(state): State<AuthzState>,
    request_ctx: Option<Extension<RequestId>>,
    Json(payload): Json<BulkAuthorizeRequest>,
) -> Result<Json<BulkAuthorizeResponse>, AppError> {
    let request_id = request_id(request_ctx.as_deref());
    let response = state
        .engine
        .clone()
        .authorize_bulk(payload, &request_id)
        .await?;
    Ok(Json(response))
}

pub async fn authorize_batch_optimized(
    State(state): State<AuthzState>,
    request_ctx: Option<Extension<RequestId>>,
    Json(payload): Json<BulkAuthorizeRequest>,
) -> Result<Json<BulkAuthorizeResponse>, AppError> {
    let request_id = request_id(request_ctx.as_deref());
    let response = state
        .engine
        .clone()
        .authorize_batch_optimized(payload, &request_id)
        .await?;
    Ok(Json(response))
}

pub async fn status(State(state): State<AuthzState>) -> Result<Json<Value>, AppError> {
    let (total, active) = state.policies.counts().await?;
    Ok(Json(json!({
        "service": "authz-service",
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "policies": {"total": total, "active": active},
        "cached_decisions": state.engine.cached_decisions(),
        "audit_queue_pending": state.audit.pending(),
        "audit_records_dropped": state.audit.dropped(),
    })))
}

pub async fn metrics_performance(State(state): State<AuthzState>) -> Json<Value> {
    Json(state.engine.metrics_snapshot())
}

/// Decision history; defaults to the `authorize` event stream.
pub async fn audit_decisions(
    State(state): State<AuthzState>,
    Query(mut query): Query<AuditQuery>,
) -> Result<Json<Vec<AuditRecord>>, AppError> {
    if query.event_type.is_none() {
        query.event_type = Some("authorize".to_string());
    }
    let records = audit_repo::query_audit_records(&state.pool, &query).await?;
    Ok(Json(records))
}

pub async fn cache_clear(State(state): State<AuthzState>) -> Json<Value> {
    state.engine.invalidate_cache();
    Json(json!({"message": "Decision cache cleared"}))
}

pub async fn warm_cache(State(state): State<AuthzState>) -> Result<Json<Value>, AppError> {
    let warmed = state.engine.warm_cache().await?;
    Ok(Json(json!({"message": "Cache warmed", "entries": warmed})))
}

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub include_acknowledged: Option<bool>,
    pub limit: Option<i64>,
}

pub async fn security_alerts(
    State(state): State<AuthzState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<Vec<SecurityAlert>>, AppError> {
    let alerts = audit_repo::list_security_alerts(
        &state.pool,
        query.include_acknowledged.unwrap_or(false),
        query.limit.unwrap_or(50).clamp(1, 500),
    )
    .await?;
    Ok(Json(alerts))
}

pub async fn acknowledge_alert(
    State(state): State<AuthzState>,
    Path(alert_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let alert_id: SecurityAlertId = alert_id
        .parse()
        .map_err(|_| AppError::BadRequest("Invalid alert id".to_string()))?;
    let acknowledged = audit_repo::acknowledge_alert(&state.pool, alert_id).await?;
    if !acknowledged {
        return Err(AppError::NotFound("Alert not found".to_string()));
    }
    Ok(Json(json!({
        "message": "Alert acknowledged",
        "alert_id": alert_id.to_string(),
    })))
}

pub async fn health(State(state): State<AuthzState>) -> Result<Json<Value>, AppError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|_| AppError::Unavailable("Database unreachable".to_string()))?;
    Ok(Json(json!({"status": "healthy", "service": "authz-service"})))
}
