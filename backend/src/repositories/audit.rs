//! Repository functions for audit records and derived security alerts.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, QueryBuilder};

use crate::models::audit::{AuditQuery, AuditRecord, SecurityAlert, ThreatLevel};
use crate::types::SecurityAlertId;

pub async fn insert_audit_record(pool: &PgPool, record: &AuditRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO audit_records (id, user_id, event_type, success, metadata, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(record.id)
    .bind(&record.user_id)
    .bind(&record.event_type)
    .bind(record.success)
    .bind(&record.metadata)
    .bind(record.created_at)
    .execute(pool)
    .await
    .map(|_| ())
}

pub async fn query_audit_records(
    pool: &PgPool,
    query: &AuditQuery,
) -> Result<Vec<AuditRecord>, sqlx::Error> {
    let mut builder = QueryBuilder::new(
        "SELECT id, user_id, event_type, success, metadata, created_at FROM audit_records WHERE 1=1",
    );
    if let Some(from) = query.from {
        builder.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = query.to {
        builder.push(" AND created_at <= ").push_bind(to);
    }
    if let Some(user_id) = &query.user_id {
        builder.push(" AND user_id = ").push_bind(user_id.clone());
    }
    if let Some(event_type) = &query.event_type {
        builder
            .push(" AND event_type = ")
            .push_bind(event_type.clone());
    }
    if let Some(success) = query.success {
        builder.push(" AND success = ").push_bind(success);
    }
    if let Some(resource) = &query.resource {
        builder
            .push(" AND metadata->>'resource' = ")
            .push_bind(resource.clone());
    }
    if let Some(action) = &query.action {
        builder
            .push(" AND metadata->>'action' = ")
            .push_bind(action.clone());
    }
    if let Some(decision) = &query.decision {
        builder
            .push(" AND metadata->>'effect' = ")
            .push_bind(decision.clone());
    }
    builder
        .push(" ORDER BY created_at DESC LIMIT ")
        .push_bind(query.limit())
        .push(" OFFSET ")
        .push_bind(query.offset());

    builder.build_query_as::<AuditRecord>().fetch_all(pool).await
}

/// Failure counts per user for one event type inside the window; feeds the
/// alert scanner.
pub async fn count_failures_by_user(
    pool: &PgPool,
    event_type: &str,
    since: DateTime<Utc>,
) -> Result<Vec<(Option<String>, i64)>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT user_id, COUNT(*)
        FROM audit_records
        WHERE event_type = $1 AND NOT success AND created_at >= $2
        GROUP BY user_id
        "#,
    )
    .bind(event_type)
    .bind(since)
    .fetch_all(pool)
    .await
}

pub async fn insert_security_alert(
    pool: &PgPool,
    alert: &SecurityAlert,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO security_alerts (id, user_id, threat_level, reason, acknowledged, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(alert.id)
    .bind(&alert.user_id)
    .bind(alert.threat_level)
    .bind(&alert.reason)
    .bind(alert.acknowledged)
    .bind(alert.created_at)
    .execute(pool)
    .await
    .map(|_| ())
}

pub async fn list_security_alerts(
    pool: &PgPool,
    include_acknowledged: bool,
    limit: i64,
) -> Result<Vec<SecurityAlert>, sqlx::Error> {
    let filter = if include_acknowledged {
        ""
    } else {
        "WHERE NOT acknowledged"
    };
    sqlx::query_as::<_, SecurityAlert>(&format!(
        "SELECT id, user_id, threat_level, reason, acknowledged, created_at \
         FROM security_alerts {filter} ORDER BY created_at DESC LIMIT $1"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn acknowledge_alert(
    pool: &PgPool,
    alert_id: SecurityAlertId,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE security_alerts SET acknowledged = TRUE WHERE id = $1")
        .bind(alert_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// True when an unacknowledged alert for the same user and threat level
/// already exists inside the window; used to avoid alert floods.
pub async fn has_recent_alert(
    pool: &PgPool,
    user_id: Option<&str>,
    threat_level: ThreatLevel,
    since: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let (count,): (i64,) = sqlx::query_as(
        r#"
        SELECT COUNT(*)
        FROM security_alerts
        WHERE user_id IS NOT DISTINCT FROM $1
          AND threat_level = $2
          AND NOT acknowledged
          AND created_at >= $3
        "#,
    )
    .bind(user_id)
    .bind(threat_level)
    .bind(since)
    .fetch_one(pool)
    .await?;
    Ok(count > 0)
}
