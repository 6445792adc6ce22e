//! Repository functions for issued-token rows.

use chrono::Utc;
use sqlx::{PgExecutor, PgPool};

use crate::models::token::TokenRecord;
use crate::types::UserId;

const TOKEN_COLUMNS: &str =
    "jti, user_id, kind, scopes, issued_at, expires_at, revoked, revoked_at";

pub async fn insert_token<'e, E>(executor: E, token: &TokenRecord) -> Result<(), sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO tokens (jti, user_id, kind, scopes, issued_at, expires_at, revoked, revoked_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(&token.jti)
    .bind(token.user_id)
    .bind(token.kind)
    .bind(&token.scopes)
    .bind(token.issued_at)
    .bind(token.expires_at)
    .bind(token.revoked)
    .bind(token.revoked_at)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn find_token(pool: &PgPool, jti: &str) -> Result<Option<TokenRecord>, sqlx::Error> {
    sqlx::query_as::<_, TokenRecord>(&format!(
        "SELECT {TOKEN_COLUMNS} FROM tokens WHERE jti = $1"
    ))
    .bind(jti)
    .fetch_optional(pool)
    .await
}

/// Marks a token revoked. Returns false when the jti is unknown.
pub async fn revoke_token<'e, E>(executor: E, jti: &str) -> Result<bool, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tokens SET revoked = TRUE, revoked_at = $2 WHERE jti = $1 AND NOT revoked",
    )
    .bind(jti)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn revoke_tokens_for_user<'e, E>(executor: E, user_id: UserId) -> Result<u64, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    let result = sqlx::query(
        "UPDATE tokens SET revoked = TRUE, revoked_at = $2 WHERE user_id = $1 AND NOT revoked",
    )
    .bind(user_id)
    .bind(Utc::now())
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

pub async fn cleanup_expired_tokens(pool: &PgPool) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM tokens WHERE expires_at <= NOW()")
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
