//! Policy CRUD with validation and version bumping.

use chrono::Utc;
use serde_json::json;
use sqlx::types::Json;
use std::sync::Arc;

use crate::db::connection::DbPool;
use crate::error::AppError;
use crate::models::policy::{Condition, CreatePolicy, Policy, PolicyTarget, UpdatePolicy};
use crate::repositories::policy as policy_repo;
use crate::services::audit_sink::AuditSink;
use crate::types::PolicyId;

/// Deep condition trees are almost certainly authoring mistakes; reject them
/// before they reach the evaluator.
const MAX_CONDITION_DEPTH: usize = 32;

pub struct PolicyService {
    pool: DbPool,
    audit: AuditSink,
}

impl PolicyService {
    pub fn new(pool: DbPool, audit: AuditSink) -> Self {
        Self { pool, audit }
    }

    pub async fn create(&self, payload: CreatePolicy) -> Result<Policy, AppError> {
        validate_target(&payload.target)?;
        if let Some(condition) = &payload.condition {
            validate_condition(condition)?;
        }

        let id = payload.id.unwrap_or_default();
        if policy_repo::find_latest_policy(&self.pool, id).await?.is_some() {
            return Err(AppError::BadRequest(
                "Policy already exists; update it instead".to_string(),
            ));
        }

        let now = Utc::now();
        let policy = Policy {
            id,
            version: 1,
            effect: payload.effect,
            target: Json(payload.target),
            condition: payload.condition.map(Json),
            obligations: Json(payload.obligations),
            advice: Json(payload.advice),
            priority: payload.priority,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        policy_repo::insert_policy(&self.pool, &policy).await?;

        self.audit_policy_event("policy_created", &policy);
        Ok(policy)
    }

    /// Inserts a new version carrying the merged fields. The bumped version
    /// becomes visible to evaluation atomically with the insert.
    pub async fn update(&self, id: PolicyId, payload: UpdatePolicy) -> Result<Policy, AppError> {
        let current = policy_repo::find_latest_policy(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound("Policy not found".to_string()))?;

        let target = payload.target.unwrap_or(current.target.0);
        validate_target(&target)?;
        let condition = match payload.condition {
            Some(condition) => {
                validate_condition(&condition)?;
                Some(condition)
            }
            None => current.condition.map(|c| c.0),
        };

        let version = policy_repo::next_version(&self.pool, id).await?;
        let policy = Policy {
            id,
            version,
            effect: payload.effect.unwrap_or(current.effect),
            target: Json(target),
            condition: condition.map(Json),
            obligations: Json(payload.obligations.unwrap_or(current.obligations.0)),
            advice: Json(payload.advice.unwrap_or(current.advice.0)),
            priority: payload.priority.unwrap_or(current.priority),
            is_active: true,
            created_at: current.created_at,
            updated_at: Utc::now(),
        };
        policy_repo::insert_policy(&self.pool, &policy).await?;

        self.audit_policy_event("policy_updated", &policy);
        Ok(policy)
    }

    pub async fn get(&self, id: PolicyId) -> Result<Policy, AppError> {
        policy_repo::find_latest_policy(&self.pool, id)
            .await?
            .ok_or_else(|| AppError::NotFound("Policy not found".to_string()))
    }

    pub async fn list(
        &self,
        include_inactive: bool,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Policy>, AppError> {
        Ok(policy_repo::list_policies(
            &self.pool,
            include_inactive,
            limit.clamp(1, 500),
            offset.max(0),
        )
        .await?)
    }

    /// Soft delete: the policy stops contributing to decisions but keeps its
    /// version history.
    pub async fn soft_delete(&self, id: PolicyId) -> Result<(), AppError> {
        let deleted = policy_repo::soft_delete_policy(&self.pool, id).await?;
        if !deleted {
            return Err(AppError::NotFound("Policy not found".to_string()));
        }
        self.audit.write(crate::models::audit::AuditRecord::new(
            None,
            "policy_deactivated",
            true,
            Some(json!({"policy_id": id.to_string()})),
        ));
        Ok(())
    }

    pub async fn hard_delete(&self, id: PolicyId) -> Result<(), AppError> {
        let deleted = policy_repo::hard_delete_policy(&self.pool, id).await?;
        if !deleted {
            return Err(AppError::NotFound("Policy not found".to_string()));
        }
        self.audit.write(crate::models::audit::AuditRecord::new(
            None,
            "policy_deleted",
            true,
            Some(json!({"policy_id": id.to_string()})),
        ));
        Ok(())
    }

    pub async fn counts(&self) -> Result<(i64, i64), AppError> {
        Ok(policy_repo::count_policies(&self.pool).await?)
    }

    fn audit_policy_event(&self, event_type: &str, policy: &Policy) {
        self.audit.write(crate::models::audit::AuditRecord::new(
            None,
            event_type,
            true,
            Some(json!({
                "policy_id": policy.id.to_string(),
                "version": policy.version,
                "effect": policy.effect.as_str(),
                "priority": policy.priority,
            })),
        ));
    }
}

fn validate_target(target: &PolicyTarget) -> Result<(), AppError> {
    for (name, predicate) in [
        ("subjects", &target.subjects),
        ("resources", &target.resources),
        ("actions", &target.actions),
    ] {
        if predicate.0.iter().any(|entry| entry.trim().is_empty()) {
            return Err(AppError::BadRequest(format!(
                "Policy target `{name}` contains an empty entry"
            )));
        }
    }
    Ok(())
}

fn validate_condition(condition: &Condition) -> Result<(), AppError> {
    if condition_depth(condition) > MAX_CONDITION_DEPTH {
        return Err(AppError::BadRequest(format!(
            "Policy condition exceeds maximum depth of {MAX_CONDITION_DEPTH}"
        )));
    }
    Ok(())
}

fn condition_depth(condition: &Condition) -> usize {
    match condition {
        Condition::And { conditions } | Condition::Or { conditions } => {
            1 + conditions.iter().map(condition_depth).max().unwrap_or(0)
        }
        Condition::Not { condition } => 1 + condition_depth(condition),
        _ => 1,
    }
}

pub type SharedPolicyService = Arc<PolicyService>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::TargetPredicate;
    use serde_json::json;

    #[test]
    fn target_validation_rejects_empty_entries() {
        let target = PolicyTarget {
            subjects: TargetPredicate(vec!["".into()]),
            ..Default::default()
        };
        assert!(validate_target(&target).is_err());
        assert!(validate_target(&PolicyTarget::default()).is_ok());
    }

    #[test]
    fn condition_depth_counts_nesting() {
        let leaf = Condition::Present {
            attribute: "action".into(),
        };
        assert_eq!(condition_depth(&leaf), 1);

        let nested = Condition::And {
            conditions: vec![Condition::Or {
                conditions: vec![Condition::Eq {
                    attribute: "action".into(),
                    value: json!("read"),
                }],
            }],
        };
        assert_eq!(condition_depth(&nested), 3);
        assert!(validate_condition(&nested).is_ok());
    }

    #[test]
    fn overly_deep_conditions_are_rejected() {
        let mut condition = Condition::Present {
            attribute: "action".into(),
        };
        for _ in 0..MAX_CONDITION_DEPTH {
            condition = Condition::Not {
                condition: Box::new(condition),
            };
        }
        assert!(validate_condition(&condition).is_err());
    }
}
