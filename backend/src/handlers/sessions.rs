//! Session management for the calling user.

use axum::{
    extract::{Extension, Path, State},
    Json,
};
use serde_json::{json, Value};

use crate::{
    error::AppError,
    models::session::SessionResponse,
    models::user::User,
    state::AuthnState,
    types::SessionId,
    utils::jwt::Claims,
};

pub async fn list_sessions(
    State(state): State<AuthnState>,
    Extension(user): Extension<User>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<SessionResponse>>, AppError> {
    let sessions = state.tokens.list_sessions(user.id).await?;
    let responses = sessions
        .into_iter()
        .map(|session| SessionResponse::from_session(session, &claims.jti))
        .collect();
    Ok(Json(responses))
}

pub async fn revoke_session(
    State(state): State<AuthnState>,
    Extension(user): Extension<User>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let session_id: SessionId = session_id
        .parse()
        .map_err(|_| AppError::BadRequest("Invalid session id".to_string()))?;

    let session = state
        .tokens
        .find_session(session_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Session not found".to_string()))?;

    if session.user_id != user.id {
        return Err(AppError::Forbidden("Forbidden".to_string()));
    }
    if session.access_jti == claims.jti {
        return Err(AppError::BadRequest(
            "Cannot revoke current session; use logout instead".to_string(),
        ));
    }

    state.tokens.end_session(&session).await?;
    Ok(Json(json!({
        "message": "Session revoked",
        "session_id": session_id.to_string(),
    })))
}

pub async fn revoke_all_sessions(
    State(state): State<AuthnState>,
    Extension(user): Extension<User>,
) -> Result<Json<Value>, AppError> {
    let ended = state.tokens.end_all_user_sessions(user.id).await?;
    Ok(Json(json!({
        "message": "All sessions revoked",
        "sessions_ended": ended,
    })))
}
