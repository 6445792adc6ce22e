//! Policy CRUD endpoints.
//!
//! Every mutation invalidates the whole decision cache after it commits, so
//! no new decision can use the prior policy version.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::AppError,
    models::policy::{CreatePolicy, PolicyResponse, UpdatePolicy},
    state::AuthzState,
    types::PolicyId,
};

fn parse_policy_id(raw: &str) -> Result<PolicyId, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest("Invalid policy id".to_string()))
}

#[derive(Debug, Deserialize)]
pub struct ListPoliciesQuery {
    pub include_inactive: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn list_policies(
    State(state): State<AuthzState>,
    Query(query): Query<ListPoliciesQuery>,
) -> Result<Json<Vec<PolicyResponse>>, AppError> {
    let policies = state
        .policies
        .list(
            query.include_inactive.unwrap_or(false),
            query.limit.unwrap_or(50),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(policies.into_iter().map(PolicyResponse::from).collect()))
}

pub async fn create_policy(
    State(state): State<AuthzState>,
    Json(payload): Json<CreatePolicy>,
) -> Result<(StatusCode, Json<PolicyResponse>), AppError> {
    let policy = state.policies.create(payload).await?;
    state.engine.invalidate_cache();
    Ok((StatusCode::CREATED, Json(PolicyResponse::from(policy))))
}

pub async fn get_policy(
    State(state): State<AuthzState>,
    Path(policy_id): Path<String>,
) -> Result<Json<PolicyResponse>, AppError> {
    let policy_id = parse_policy_id(&policy_id)?;
    let policy = state.policies.get(policy_id).await?;
    Ok(Json(PolicyResponse::from(policy)))
}

pub async fn update_policy(
    State(state): State<AuthzState>,
    Path(policy_id): Path<String>,
    Json(payload): Json<UpdatePolicy>,
) -> Result<Json<PolicyResponse>, AppError> {
    let policy_id = parse_policy_id(&policy_id)?;
    let policy = state.policies.update(policy_id, payload).await?;
    state.engine.invalidate_cache();
    Ok(Json(PolicyResponse::from(policy)))
}

#[derive(Debug, Deserialize)]
pub struct DeletePolicyQuery {
    /// Soft delete (deactivate) by default; `hard=true` removes the rows.
    pub hard: Option<bool>,
}

pub async fn delete_policy(
    State(state): State<AuthzState>,
    Path(policy_id): Path<String>,
    Query(query): Query<DeletePolicyQuery>,
) -> Result<Json<Value>, AppError> {
    let policy_id = parse_policy_id(&policy_id)?;
    let hard = query.hard.unwrap_or(false);
    let message = if hard {
        state.policies.hard_delete(policy_id).await?;
        "Policy deleted"
    } else {
        state.policies.soft_delete(policy_id).await?;
        "Policy deactivated"
    };
    state.engine.invalidate_cache();
    Ok(Json(json!({
        "message": message,
        "policy_id": policy_id.to_string(),
    })))
}
