//! Models for tracking active user sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use crate::types::{SessionId, UserId};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
/// Database representation of an active user session.
///
/// A session joins exactly one access/refresh token pair; ending the session
/// revokes both tokens and deletes the row in a single transaction.
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    /// `jti` of the access token bound to this session.
    pub access_jti: String,
    /// `jti` of the refresh token bound to this session.
    pub refresh_jti: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
/// Public-facing session summary returned by `GET /sessions/me`.
pub struct SessionResponse {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub is_current: bool,
}

impl SessionResponse {
    pub fn from_session(session: Session, current_jti: &str) -> Self {
        let is_current = session.access_jti == current_jti;
        Self {
            id: session.id.to_string(),
            created_at: session.created_at,
            last_seen_at: session.last_seen_at,
            expires_at: session.expires_at,
            is_current,
        }
    }
}
