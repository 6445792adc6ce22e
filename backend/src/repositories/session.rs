//! Repository functions for session rows.

use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};

use crate::models::session::Session;
use crate::types::{SessionId, UserId};

const SESSION_COLUMNS: &str =
    "id, user_id, access_jti, refresh_jti, created_at, last_seen_at, expires_at";

pub async fn insert_session<'e, E>(executor: E, session: &Session) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO sessions (id, user_id, access_jti, refresh_jti, created_at, last_seen_at, expires_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(session.id)
    .bind(session.user_id)
    .bind(&session.access_jti)
    .bind(&session.refresh_jti)
    .bind(session.created_at)
    .bind(session.last_seen_at)
    .bind(session.expires_at)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn find_session_by_id(
    pool: &PgPool,
    session_id: SessionId,
) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
    ))
    .bind(session_id)
    .fetch_optional(pool)
    .await
}

pub async fn find_session_by_access_jti(
    pool: &PgPool,
    access_jti: &str,
) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE access_jti = $1"
    ))
    .bind(access_jti)
    .fetch_optional(pool)
    .await
}

pub async fn find_session_by_refresh_jti(
    pool: &PgPool,
    refresh_jti: &str,
) -> Result<Option<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE refresh_jti = $1"
    ))
    .bind(refresh_jti)
    .fetch_optional(pool)
    .await
}

pub async fn list_sessions_for_user(
    pool: &PgPool,
    user_id: UserId,
) -> Result<Vec<Session>, sqlx::Error> {
    sqlx::query_as::<_, Session>(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = $1 \
         ORDER BY last_seen_at DESC NULLS LAST, created_at DESC, id DESC"
    ))
    .bind(user_id)
    .fetch_all(pool)
    .await
}

/// Rebinds a session to a fresh token pair after a refresh.
pub async fn update_session_tokens<'e, E>(
    executor: E,
    current_refresh_jti: &str,
    new_access_jti: &str,
    new_refresh_jti: &str,
    expires_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        UPDATE sessions
        SET access_jti = $2, refresh_jti = $3, last_seen_at = $4, expires_at = $5
        WHERE refresh_jti = $1
        "#,
    )
    .bind(current_refresh_jti)
    .bind(new_access_jti)
    .bind(new_refresh_jti)
    .bind(Utc::now())
    .bind(expires_at)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn touch_session_by_access_jti(
    pool: &PgPool,
    access_jti: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE sessions SET last_seen_at = $2 WHERE access_jti = $1")
        .bind(access_jti)
        .bind(Utc::now())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete_session_by_id<'e, E>(
    executor: E,
    session_id: SessionId,
) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query("DELETE FROM sessions WHERE id = $1")
        .bind(session_id)
        .execute(executor)
        .await
        .map(|_| ())
}

pub async fn delete_sessions_for_user<'e, E>(
    executor: E,
    user_id: UserId,
) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query("DELETE FROM sessions WHERE user_id = $1")
        .bind(user_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

pub async fn cleanup_expired_sessions(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
