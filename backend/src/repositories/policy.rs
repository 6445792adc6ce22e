//! Repository functions for policy rows.
//!
//! A policy is addressed by `(id, version)`; reads resolve the highest
//! version per id. Soft delete flips `is_active` on every version so the
//! policy drops out of evaluation without losing history.

use chrono::Utc;
use sqlx::PgPool;

use crate::models::policy::Policy;
use crate::types::PolicyId;

const POLICY_COLUMNS: &str = "id, version, effect, target, condition, obligations, advice, \
     priority, is_active, created_at, updated_at";

pub async fn insert_policy(pool: &PgPool, policy: &Policy) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO policies
            (id, version, effect, target, condition, obligations, advice,
             priority, is_active, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        "#,
    )
    .bind(policy.id)
    .bind(policy.version)
    .bind(policy.effect)
    .bind(&policy.target)
    .bind(&policy.condition)
    .bind(&policy.obligations)
    .bind(&policy.advice)
    .bind(policy.priority)
    .bind(policy.is_active)
    .bind(policy.created_at)
    .bind(policy.updated_at)
    .execute(pool)
    .await
    .map(|_| ())
}

/// Latest version of one policy, active or not.
pub async fn find_latest_policy(
    pool: &PgPool,
    policy_id: PolicyId,
) -> Result<Option<Policy>, sqlx::Error> {
    sqlx::query_as::<_, Policy>(&format!(
        "SELECT {POLICY_COLUMNS} FROM policies WHERE id = $1 ORDER BY version DESC LIMIT 1"
    ))
    .bind(policy_id)
    .fetch_optional(pool)
    .await
}

/// All policies consulted during evaluation: the highest active version per id.
pub async fn load_active_policies(pool: &PgPool) -> Result<Vec<Policy>, sqlx::Error> {
    sqlx::query_as::<_, Policy>(&format!(
        "SELECT DISTINCT ON (id) {POLICY_COLUMNS} FROM policies \
         WHERE is_active ORDER BY id, version DESC"
    ))
    .fetch_all(pool)
    .await
}

pub async fn list_policies(
    pool: &PgPool,
    include_inactive: bool,
    limit: i64,
    offset: i64,
) -> Result<Vec<Policy>, sqlx::Error> {
    let filter = if include_inactive {
        ""
    } else {
        "WHERE is_active"
    };
    sqlx::query_as::<_, Policy>(&format!(
        "SELECT * FROM (SELECT DISTINCT ON (id) {POLICY_COLUMNS} FROM policies \
         {filter} ORDER BY id, version DESC) latest \
         ORDER BY priority DESC, updated_at DESC LIMIT $1 OFFSET $2"
    ))
    .bind(limit)
    .bind(offset)
    .fetch_all(pool)
    .await
}

pub async fn next_version(pool: &PgPool, policy_id: PolicyId) -> Result<i64, sqlx::Error> {
    let (version,): (i64,) =
        sqlx::query_as("SELECT COALESCE(MAX(version), 0) + 1 FROM policies WHERE id = $1")
            .bind(policy_id)
            .fetch_one(pool)
            .await?;
    Ok(version)
}

/// Deactivates every version of the policy. Returns false for unknown ids.
pub async fn soft_delete_policy(pool: &PgPool, policy_id: PolicyId) -> Result<bool, sqlx::Error> {
    let result =
        sqlx::query("UPDATE policies SET is_active = FALSE, updated_at = $2 WHERE id = $1")
            .bind(policy_id)
            .bind(Utc::now())
            .execute(pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn hard_delete_policy(pool: &PgPool, policy_id: PolicyId) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM policies WHERE id = $1")
        .bind(policy_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_policies(pool: &PgPool) -> Result<(i64, i64), sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT COUNT(DISTINCT id),
               COUNT(DISTINCT id) FILTER (WHERE is_active)
        FROM policies
        "#,
    )
    .fetch_one(pool)
    .await
}
