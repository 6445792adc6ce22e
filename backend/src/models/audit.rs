//! Audit records and derived security alerts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow};
use utoipa::ToSchema;

use crate::types::{AuditRecordId, SecurityAlertId};

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
/// Append-only audit record; never mutated after write.
pub struct AuditRecord {
    pub id: AuditRecordId,
    pub user_id: Option<String>,
    pub event_type: String,
    pub success: bool,
    pub metadata: Option<Json<Value>>,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(
        user_id: Option<String>,
        event_type: impl Into<String>,
        success: bool,
        metadata: Option<Value>,
    ) -> Self {
        Self {
            id: AuditRecordId::new(),
            user_id,
            event_type: event_type.into(),
            success,
            metadata: metadata.map(Json),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
/// Query parameters accepted by the audit listing endpoints.
pub struct AuditQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub event_type: Option<String>,
    pub success: Option<bool>,
    /// Filters on the decision metadata recorded with authorize events.
    pub resource: Option<String>,
    pub action: Option<String>,
    pub decision: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQuery {
    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(50).clamp(1, 500)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, ToSchema)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
/// Severity of a derived security alert.
pub enum ThreatLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ThreatLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatLevel::Low => "low",
            ThreatLevel::Medium => "medium",
            ThreatLevel::High => "high",
            ThreatLevel::Critical => "critical",
        }
    }
}

impl Serialize for ThreatLevel {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ThreatLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "low" => Ok(ThreatLevel::Low),
            "medium" => Ok(ThreatLevel::Medium),
            "high" => Ok(ThreatLevel::High),
            "critical" => Ok(ThreatLevel::Critical),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["low", "medium", "high", "critical"],
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
/// Alert derived from audit patterns; independent of the decision stream.
pub struct SecurityAlert {
    pub id: SecurityAlertId,
    pub user_id: Option<String>,
    pub threat_level: ThreatLevel,
    pub reason: String,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audit_record_carries_metadata() {
        let record = AuditRecord::new(
            Some("user-1".into()),
            "login_failed",
            false,
            Some(json!({"reason": "invalid_password"})),
        );
        assert_eq!(record.event_type, "login_failed");
        assert!(!record.success);
        assert_eq!(
            record.metadata.as_ref().unwrap().0["reason"],
            "invalid_password"
        );
    }

    #[test]
    fn query_clamps_paging() {
        let query = AuditQuery {
            limit: Some(10_000),
            offset: Some(-5),
            ..Default::default()
        };
        assert_eq!(query.limit(), 500);
        assert_eq!(query.offset(), 0);

        let defaults = AuditQuery::default();
        assert_eq!(defaults.limit(), 50);
        assert_eq!(defaults.offset(), 0);
    }

    #[test]
    fn threat_level_round_trips() {
        for level in [
            ThreatLevel::Low,
            ThreatLevel::Medium,
            ThreatLevel::High,
            ThreatLevel::Critical,
        ] {
            let text = serde_json::to_string(&level).unwrap();
            let back: ThreatLevel = serde_json::from_str(&text).unwrap();
            assert_eq!(level, back);
        }
    }
}
