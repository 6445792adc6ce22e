//! Profile self-service and admin user management.

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use validator::Validate;

use crate::{
    error::AppError,
    models::user::{
        AdminUpdateUser, ChangePasswordRequest, CreateUser, UpdateProfile, User, UserResponse,
    },
    state::AuthnState,
    types::UserId,
    utils::password::verify_password,
};

fn parse_user_id(raw: &str) -> Result<UserId, AppError> {
    raw.parse()
        .map_err(|_| AppError::BadRequest("Invalid user id".to_string()))
}

pub async fn me(Extension(user): Extension<User>) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

pub async fn update_me(
    State(state): State<AuthnState>,
    Extension(user): Extension<User>,
    Json(payload): Json<UpdateProfile>,
) -> Result<Json<UserResponse>, AppError> {
    payload.validate()?;
    let updated = state.users.update_profile(user.id, payload).await?;
    Ok(Json(UserResponse::from(updated)))
}

/// Changes the caller's password and ends every session of that user, forcing
/// re-login on other devices.
pub async fn change_password(
    State(state): State<AuthnState>,
    Extension(user): Extension<User>,
    Json(payload): Json<ChangePasswordRequest>,
) -> Result<Json<Value>, AppError> {
    payload.validate()?;
    if payload.new_password == payload.current_password {
        return Err(AppError::BadRequest(
            "New password must differ from current password".to_string(),
        ));
    }

    let current = payload.current_password.clone();
    let stored_hash = user.password_hash.clone();
    let matches = tokio::task::spawn_blocking(move || verify_password(&current, &stored_hash))
        .await
        .map_err(|e| AppError::InternalServerError(e.into()))?
        .map_err(AppError::InternalServerError)?;
    if !matches {
        return Err(AppError::Unauthorized(
            "Current password is incorrect".to_string(),
        ));
    }

    state
        .users
        .change_password(user.id, &payload.new_password)
        .await?;
    let ended = state.tokens.end_all_user_sessions(user.id).await?;

    Ok(Json(json!({
        "message": "Password updated successfully",
        "sessions_ended": ended,
    })))
}

#[derive(Debug, Deserialize)]
pub struct ListUsersQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

pub async fn admin_list_users(
    State(state): State<AuthnState>,
    Query(query): Query<ListUsersQuery>,
) -> Result<Json<Vec<UserResponse>>, AppError> {
    let users = state
        .users
        .list_users(query.limit.unwrap_or(50), query.offset.unwrap_or(0))
        .await?;
    Ok(Json(users.into_iter().map(UserResponse::from).collect()))
}

pub async fn admin_create_user(
    State(state): State<AuthnState>,
    Json(payload): Json<CreateUser>,
) -> Result<(StatusCode, Json<UserResponse>), AppError> {
    payload.validate()?;
    let user = state.users.create_user(payload).await?;
    Ok((StatusCode::CREATED, Json(UserResponse::from(user))))
}

pub async fn admin_get_user(
    State(state): State<AuthnState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserResponse>, AppError> {
    let user_id = parse_user_id(&user_id)?;
    let user = state
        .users
        .get_user_by_id(user_id)
        .await?
        .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;
    Ok(Json(UserResponse::from(user)))
}

pub async fn admin_update_user(
    State(state): State<AuthnState>,
    Path(user_id): Path<String>,
    Json(payload): Json<AdminUpdateUser>,
) -> Result<Json<UserResponse>, AppError> {
    let user_id = parse_user_id(&user_id)?;
    let user = state.users.admin_update_user(user_id, payload).await?;
    // Role or activation changes must not ride on previously issued tokens.
    if !user.is_active {
        state.tokens.end_all_user_sessions(user_id).await?;
    }
    Ok(Json(UserResponse::from(user)))
}

pub async fn admin_delete_user(
    State(state): State<AuthnState>,
    Extension(actor): Extension<User>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let user_id = parse_user_id(&user_id)?;
    if actor.id == user_id {
        return Err(AppError::BadRequest(
            "Cannot delete the calling account".to_string(),
        ));
    }
    state.tokens.end_all_user_sessions(user_id).await?;
    state.users.delete_user(user_id).await?;
    Ok(Json(json!({"message": "User deleted"})))
}
