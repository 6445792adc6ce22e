//! Repository functions for user rows.

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::user::User;
use crate::types::UserId;

const USER_COLUMNS: &str = "id, username, email, password_hash, first_name, last_name, \
     display_name, roles, primary_role, is_active, email_verified, mfa_enabled, \
     failed_login_attempts, locked_until, last_login, metadata, created_at, updated_at";

/// True when the error is a Postgres unique-constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.code().as_deref() == Some("23505")
    )
}

pub async fn find_user_by_id(pool: &PgPool, user_id: UserId) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
        .bind(user_id)
        .fetch_optional(pool)
        .await
}

pub async fn find_user_by_username(
    pool: &PgPool,
    username: &str,
) -> Result<Option<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
    ))
    .bind(username)
    .fetch_optional(pool)
    .await
}

pub async fn insert_user(pool: &PgPool, user: &User) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO users
            (id, username, email, password_hash, first_name, last_name, display_name,
             roles, primary_role, is_active, email_verified, mfa_enabled,
             failed_login_attempts, locked_until, last_login, metadata, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        "#,
    )
    .bind(user.id)
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(&user.first_name)
    .bind(&user.last_name)
    .bind(&user.display_name)
    .bind(&user.roles)
    .bind(&user.primary_role)
    .bind(user.is_active)
    .bind(user.email_verified)
    .bind(user.mfa_enabled)
    .bind(user.failed_login_attempts)
    .bind(user.locked_until)
    .bind(user.last_login)
    .bind(&user.metadata)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await
    .map(|_| ())
}

/// Full-row update; the service layer loads, mutates, and saves.
pub async fn update_user(pool: &PgPool, user: &User) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE users
        SET email = $2, first_name = $3, last_name = $4, display_name = $5,
            roles = $6, primary_role = $7, is_active = $8, email_verified = $9,
            mfa_enabled = $10, metadata = $11, updated_at = $12
        WHERE id = $1
        "#,
    )
    .bind(user.id)
    .bind(&user.email)
    .bind(&user.first_name)
    .bind(&user.last_name)
    .bind(&user.display_name)
    .bind(&user.roles)
    .bind(&user.primary_role)
    .bind(user.is_active)
    .bind(user.email_verified)
    .bind(user.mfa_enabled)
    .bind(&user.metadata)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn record_failed_login(
    pool: &PgPool,
    user_id: UserId,
    failed_attempts: i32,
    locked_until: Option<DateTime<Utc>>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE users
        SET failed_login_attempts = $2, locked_until = $3, updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(failed_attempts)
    .bind(locked_until)
    .bind(Utc::now())
    .execute(pool)
    .await
    .map(|_| ())
}

pub async fn record_successful_login(pool: &PgPool, user_id: UserId) -> Result<(), sqlx::Error> {
    let now = Utc::now();
    sqlx::query(
        r#"
        UPDATE users
        SET failed_login_attempts = 0, locked_until = NULL, last_login = $2, updated_at = $2
        WHERE id = $1
        "#,
    )
    .bind(user_id)
    .bind(now)
    .execute(pool)
    .await
    .map(|_| ())
}

pub async fn update_password_hash(
    pool: &PgPool,
    user_id: UserId,
    password_hash: &str,
) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1")
            .bind(user_id)
            .bind(password_hash)
            .bind(Utc::now())
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Hard delete; sessions and tokens cascade.
pub async fn delete_user(pool: &PgPool, user_id: UserId) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM users WHERE id = $1")
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_users(
    pool: &PgPool,
    limit: i64,
    offset: i64,
) -> Result<Vec<User>, sqlx::Error> {
    sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users ORDER BY created_at DESC, id LIMIT $1 OFFSET $2"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct UserCounts {
    pub total: i64,
    pub active: i64,
    pub locked: i64,
}

pub async fn count_users(pool: &PgPool) -> Result<UserCounts, sqlx::Error> {
    let (total, active, locked): (i64, i64, i64) = sqlx::query_as(
        r#"
        SELECT
            COUNT(*),
            COUNT(*) FILTER (WHERE is_active),
            COUNT(*) FILTER (WHERE locked_until > NOW())
        FROM users
        "#,
    )
    .fetch_one(pool)
    .await?;
    Ok(UserCounts {
        total,
        active,
        locked,
    })
}
