//! Authentication endpoints: login, refresh, logout, validate.

use axum::{
    extract::{Extension, State},
    http::{header, HeaderMap},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    error::AppError,
    models::token::ValidateResponse,
    models::user::{LoginRequest, LoginResponse, UserResponse},
    services::user_service::{AuthFailure, AuthOutcome},
    state::AuthnState,
    types::UserId,
    utils::jwt::Claims,
};

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .filter(|token| !token.is_empty())
}

pub async fn login(
    State(state): State<AuthnState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let user = match state
        .users
        .authenticate(&payload.username, &payload.password)
        .await?
    {
        AuthOutcome::Success(user) => user,
        AuthOutcome::Failure(AuthFailure::AccountLocked) => {
            return Err(AppError::Locked(
                "Account is temporarily locked due to repeated failed logins".to_string(),
            ))
        }
        // One message for every other failure; the audit trail keeps the
        // distinction, the caller must not learn it.
        AuthOutcome::Failure(_) => {
            return Err(AppError::Unauthorized(
                "Invalid username or password".to_string(),
            ))
        }
    };

    let issued = state.tokens.issue_tokens(&user).await?;
    Ok(Json(LoginResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: issued.expires_in,
        user: UserResponse::from(user),
    }))
}

pub async fn refresh(
    State(state): State<AuthnState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    let claims = state.tokens.check_refresh(&payload.refresh_token).await?;

    let user_id: UserId = claims
        .sub
        .parse()
        .map_err(|_| AppError::Unauthorized("Invalid refresh token subject".to_string()))?;
    let user = state
        .users
        .get_user_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::Unauthorized("Unknown user".to_string()))?;
    if !user.is_active {
        return Err(AppError::Unauthorized("Account is inactive".to_string()));
    }
    if user.is_locked(chrono::Utc::now()) {
        return Err(AppError::Locked(
            "Account is temporarily locked".to_string(),
        ));
    }

    let issued = state.tokens.refresh(&user, &claims).await?;
    let refresh_token = if state.config.refresh_rotation {
        issued.refresh_token
    } else {
        payload.refresh_token
    };

    Ok(Json(LoginResponse {
        access_token: issued.access_token,
        refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: issued.expires_in,
        user: UserResponse::from(user),
    }))
}

/// Ends the session owning the presented access token.
pub async fn logout(
    State(state): State<AuthnState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Value>, AppError> {
    let ended = state.tokens.end_session_by_access_jti(&claims.jti).await?;
    if !ended {
        // No session row (already ended elsewhere); still kill the token.
        state.tokens.revoke(&claims.jti).await?;
    }
    Ok(Json(json!({"message": "Logged out"})))
}

/// Token introspection. Invalid tokens get 401 so enforcement points need no
/// body inspection on the failure path.
pub async fn validate(
    State(state): State<AuthnState>,
    headers: HeaderMap,
) -> Result<Json<ValidateResponse>, AppError> {
    let token = bearer_token(&headers)
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;
    let response = state.tokens.validate(token).await?;
    if !response.valid {
        return Err(AppError::Unauthorized(
            "Invalid or expired token".to_string(),
        ));
    }
    Ok(Json(response))
}

pub async fn health(State(state): State<AuthnState>) -> Result<Json<Value>, AppError> {
    sqlx::query("SELECT 1")
        .execute(&state.pool)
        .await
        .map_err(|_| AppError::Unavailable("Database unreachable".to_string()))?;
    Ok(Json(json!({"status": "healthy", "service": "authn-service"})))
}

pub async fn metrics(State(state): State<AuthnState>) -> Result<Json<Value>, AppError> {
    let mut metrics = state.users.metrics().await?;
    metrics["audit_queue_pending"] = json!(state.audit.pending());
    metrics["audit_records_dropped"] = json!(state.audit.dropped());
    Ok(Json(metrics))
}
