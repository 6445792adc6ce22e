//! Policy model: targets, condition trees, and per-policy evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use sqlx::{types::Json, FromRow};
use utoipa::ToSchema;

use crate::models::decision::AttributeBag;
use crate::types::PolicyId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, ToSchema)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
/// What a single policy grants when it applies.
pub enum Effect {
    Permit,
    Deny,
}

impl Effect {
    /// Returns the canonical snake_case representation of the effect.
    pub fn as_str(&self) -> &'static str {
        match self {
            Effect::Permit => "permit",
            Effect::Deny => "deny",
        }
    }
}

impl Serialize for Effect {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Effect {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            // primary canonical values (snake_case)
            "permit" => Ok(Effect::Permit),
            "deny" => Ok(Effect::Deny),
            // tolerate common legacy casings
            "Permit" | "PERMIT" => Ok(Effect::Permit),
            "Deny" | "DENY" => Ok(Effect::Deny),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["permit", "deny"],
            )),
        }
    }
}

/// One target dimension: a set of accepted values.
///
/// An empty set or a literal `*` entry matches anything. Subject predicates
/// additionally accept `role:<name>` entries matched against the subject's
/// roles. Resource entries ending in `/*` prefix-match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(transparent)]
pub struct TargetPredicate(pub Vec<String>);

impl TargetPredicate {
    pub fn wildcard() -> Self {
        Self(vec!["*".to_string()])
    }

    pub fn is_wildcard(&self) -> bool {
        self.0.is_empty() || self.0.iter().any(|entry| entry == "*")
    }

    fn matches_value(&self, value: &str) -> bool {
        if self.is_wildcard() {
            return true;
        }
        self.0.iter().any(|entry| {
            if let Some(prefix) = entry.strip_suffix("/*") {
                value == prefix || value.starts_with(&format!("{prefix}/"))
            } else {
                entry == value
            }
        })
    }

    fn matches_subject(&self, subject_id: &str, roles: &[String]) -> bool {
        if self.is_wildcard() {
            return true;
        }
        self.0.iter().any(|entry| {
            if let Some(role) = entry.strip_prefix("role:") {
                roles.iter().any(|held| held == role)
            } else {
                entry == subject_id
            }
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
/// The applicability filter of a policy.
pub struct PolicyTarget {
    #[serde(default)]
    pub subjects: TargetPredicate,
    #[serde(default)]
    pub resources: TargetPredicate,
    #[serde(default)]
    pub actions: TargetPredicate,
}

impl PolicyTarget {
    /// True when every dimension accepts the request's value.
    pub fn matches(&self, subject_id: &str, roles: &[String], resource: &str, action: &str) -> bool {
        self.subjects.matches_subject(subject_id, roles)
            && self.resources.matches_value(resource)
            && self.actions.matches_value(action)
    }

    /// True when the subject predicate could apply to a caller holding any of
    /// `roles` — used by the batch-optimized role pre-filter.
    pub fn could_apply_to_roles(&self, roles: &[String]) -> bool {
        if self.subjects.is_wildcard() {
            return true;
        }
        self.subjects.0.iter().any(|entry| match entry.strip_prefix("role:") {
            Some(role) => roles.iter().any(|held| held == role),
            // Plain subject-id entries cannot be excluded by role alone.
            None => true,
        })
    }
}

/// Three-valued outcome of evaluating a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriState {
    True,
    False,
    Unknown,
}

impl TriState {
    fn from_bool(value: bool) -> Self {
        if value {
            TriState::True
        } else {
            TriState::False
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
#[schema(no_recursion)]
/// Boolean expression tree over request attributes.
///
/// A condition that references a missing attribute evaluates to `Unknown`,
/// which surfaces as an indeterminate policy in the combining step.
pub enum Condition {
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
    Eq { attribute: String, value: Value },
    Ne { attribute: String, value: Value },
    Gt { attribute: String, value: Value },
    Ge { attribute: String, value: Value },
    Lt { attribute: String, value: Value },
    Le { attribute: String, value: Value },
    In { attribute: String, values: Vec<Value> },
    Contains { attribute: String, value: Value },
    Present { attribute: String },
}

impl Condition {
    pub fn evaluate(&self, attrs: &AttributeBag) -> TriState {
        match self {
            Condition::And { conditions } => {
                let mut unknown = false;
                for condition in conditions {
                    match condition.evaluate(attrs) {
                        TriState::False => return TriState::False,
                        TriState::Unknown => unknown = true,
                        TriState::True => {}
                    }
                }
                if unknown {
                    TriState::Unknown
                } else {
                    TriState::True
                }
            }
            Condition::Or { conditions } => {
                let mut unknown = false;
                for condition in conditions {
                    match condition.evaluate(attrs) {
                        TriState::True => return TriState::True,
                        TriState::Unknown => unknown = true,
                        TriState::False => {}
                    }
                }
                if unknown {
                    TriState::Unknown
                } else {
                    TriState::False
                }
            }
            Condition::Not { condition } => match condition.evaluate(attrs) {
                TriState::True => TriState::False,
                TriState::False => TriState::True,
                TriState::Unknown => TriState::Unknown,
            },
            Condition::Eq { attribute, value } => {
                with_attribute(attrs, attribute, |actual| {
                    TriState::from_bool(actual == value)
                })
            }
            Condition::Ne { attribute, value } => {
                with_attribute(attrs, attribute, |actual| {
                    TriState::from_bool(actual != value)
                })
            }
            Condition::Gt { attribute, value } => compare(attrs, attribute, value, |o| o.is_gt()),
            Condition::Ge { attribute, value } => compare(attrs, attribute, value, |o| o.is_ge()),
            Condition::Lt { attribute, value } => compare(attrs, attribute, value, |o| o.is_lt()),
            Condition::Le { attribute, value } => compare(attrs, attribute, value, |o| o.is_le()),
            Condition::In { attribute, values } => with_attribute(attrs, attribute, |actual| {
                TriState::from_bool(values.iter().any(|candidate| candidate == actual))
            }),
            Condition::Contains { attribute, value } => {
                with_attribute(attrs, attribute, |actual| match actual {
                    Value::Array(items) => {
                        TriState::from_bool(items.iter().any(|item| item == value))
                    }
                    Value::String(haystack) => match value.as_str() {
                        Some(needle) => TriState::from_bool(haystack.contains(needle)),
                        None => TriState::Unknown,
                    },
                    _ => TriState::Unknown,
                })
            }
            Condition::Present { attribute } => TriState::from_bool(attrs.get(attribute).is_some()),
        }
    }
}

fn with_attribute<F>(attrs: &AttributeBag, attribute: &str, f: F) -> TriState
where
    F: FnOnce(&Value) -> TriState,
{
    match attrs.get(attribute) {
        Some(value) => f(value),
        None => TriState::Unknown,
    }
}

fn compare<F>(attrs: &AttributeBag, attribute: &str, expected: &Value, accept: F) -> TriState
where
    F: FnOnce(std::cmp::Ordering) -> bool,
{
    with_attribute(attrs, attribute, |actual| {
        let ordering = match (actual, expected) {
            (Value::Number(a), Value::Number(b)) => {
                match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                }
            }
            (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
            _ => None,
        };
        match ordering {
            Some(ordering) => TriState::from_bool(accept(ordering)),
            None => TriState::Unknown,
        }
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
/// Database representation of one policy version.
pub struct Policy {
    pub id: PolicyId,
    /// Monotonic version; bumped on every update.
    pub version: i64,
    pub effect: Effect,
    pub target: Json<PolicyTarget>,
    pub condition: Option<Json<Condition>>,
    pub obligations: Json<Vec<Value>>,
    pub advice: Json<Vec<Value>>,
    /// Higher priority wins on conflict.
    pub priority: i32,
    /// Inactive policies never contribute to a decision.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    /// Evaluates this policy's condition for a request whose target already
    /// matched. `None` condition means the policy applies unconditionally.
    pub fn applies(&self, attrs: &AttributeBag) -> TriState {
        match &self.condition {
            Some(condition) => condition.evaluate(attrs),
            None => TriState::True,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
/// Payload for creating a policy.
pub struct CreatePolicy {
    /// Client-supplied id; generated when absent.
    #[serde(default)]
    #[schema(value_type = Option<String>)]
    pub id: Option<PolicyId>,
    pub effect: Effect,
    #[serde(default)]
    pub target: PolicyTarget,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub obligations: Vec<Value>,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    pub advice: Vec<Value>,
    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
/// Payload for updating a policy; omitted fields keep their current value.
pub struct UpdatePolicy {
    pub effect: Option<Effect>,
    pub target: Option<PolicyTarget>,
    pub condition: Option<Condition>,
    #[schema(value_type = Vec<Object>)]
    pub obligations: Option<Vec<Value>>,
    #[schema(value_type = Vec<Object>)]
    pub advice: Option<Vec<Value>>,
    pub priority: Option<i32>,
}

#[derive(Debug, Serialize, ToSchema)]
/// Public-facing representation of a policy.
pub struct PolicyResponse {
    pub id: String,
    pub version: i64,
    pub effect: Effect,
    pub target: PolicyTarget,
    #[schema(value_type = Object)]
    pub condition: Option<Condition>,
    #[schema(value_type = Vec<Object>)]
    pub obligations: Vec<Value>,
    #[schema(value_type = Vec<Object>)]
    pub advice: Vec<Value>,
    pub priority: i32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Policy> for PolicyResponse {
    fn from(policy: Policy) -> Self {
        Self {
            id: policy.id.to_string(),
            version: policy.version,
            effect: policy.effect,
            target: policy.target.0,
            condition: policy.condition.map(|c| c.0),
            obligations: policy.obligations.0,
            advice: policy.advice.0,
            priority: policy.priority,
            is_active: policy.is_active,
            created_at: policy.created_at,
            updated_at: policy.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::decision::SubjectDescriptor;
    use serde_json::{json, Map};

    fn bag(roles: &[&str]) -> AttributeBag {
        let mut attributes = Map::new();
        attributes.insert("clearance".into(), json!(3));
        attributes.insert("department".into(), json!("engineering"));
        let subject = SubjectDescriptor {
            id: "alice".into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            attributes,
        };
        AttributeBag::from_request(&subject, "doc1", "read", &Map::new())
    }

    #[test]
    fn effect_serde_accepts_and_emits_snake_case() {
        let permit: Effect = serde_json::from_str("\"permit\"").unwrap();
        let deny: Effect = serde_json::from_str("\"DENY\"").unwrap();
        assert_eq!(permit, Effect::Permit);
        assert_eq!(deny, Effect::Deny);
        assert_eq!(serde_json::to_value(Effect::Permit).unwrap(), "permit");
    }

    #[test]
    fn wildcard_target_matches_anything() {
        let target = PolicyTarget::default();
        assert!(target.matches("anyone", &[], "anything", "whatever"));
    }

    #[test]
    fn subject_predicate_matches_ids_and_roles() {
        let target = PolicyTarget {
            subjects: TargetPredicate(vec!["bob".into(), "role:admin".into()]),
            resources: TargetPredicate::wildcard(),
            actions: TargetPredicate::wildcard(),
        };
        assert!(target.matches("bob", &[], "doc1", "read"));
        assert!(target.matches("alice", &["admin".into()], "doc1", "read"));
        assert!(!target.matches("alice", &["user".into()], "doc1", "read"));
    }

    #[test]
    fn resource_predicate_supports_prefix_entries() {
        let target = PolicyTarget {
            subjects: TargetPredicate::wildcard(),
            resources: TargetPredicate(vec!["docs/*".into()]),
            actions: TargetPredicate::wildcard(),
        };
        assert!(target.matches("alice", &[], "docs/report", "read"));
        assert!(target.matches("alice", &[], "docs", "read"));
        assert!(!target.matches("alice", &[], "images/logo", "read"));
    }

    #[test]
    fn role_prefilter_keeps_id_entries() {
        let by_role = PolicyTarget {
            subjects: TargetPredicate(vec!["role:auditor".into()]),
            ..Default::default()
        };
        assert!(!by_role.could_apply_to_roles(&["user".into()]));
        assert!(by_role.could_apply_to_roles(&["auditor".into()]));

        let by_id = PolicyTarget {
            subjects: TargetPredicate(vec!["bob".into()]),
            ..Default::default()
        };
        // An id entry cannot be ruled out by roles alone.
        assert!(by_id.could_apply_to_roles(&["user".into()]));
    }

    #[test]
    fn condition_eq_and_comparisons() {
        let attrs = bag(&["user"]);
        let eq = Condition::Eq {
            attribute: "subject.department".into(),
            value: json!("engineering"),
        };
        assert_eq!(eq.evaluate(&attrs), TriState::True);

        let gt = Condition::Gt {
            attribute: "subject.clearance".into(),
            value: json!(2),
        };
        assert_eq!(gt.evaluate(&attrs), TriState::True);

        let lt = Condition::Lt {
            attribute: "subject.clearance".into(),
            value: json!(2),
        };
        assert_eq!(lt.evaluate(&attrs), TriState::False);
    }

    #[test]
    fn missing_attribute_is_unknown_and_propagates() {
        let attrs = bag(&["user"]);
        let missing = Condition::Eq {
            attribute: "context.ip".into(),
            value: json!("10.0.0.1"),
        };
        assert_eq!(missing.evaluate(&attrs), TriState::Unknown);

        // And with one unknown branch and no false branch stays unknown.
        let and = Condition::And {
            conditions: vec![
                missing.clone(),
                Condition::Present {
                    attribute: "subject.id".into(),
                },
            ],
        };
        assert_eq!(and.evaluate(&attrs), TriState::Unknown);

        // A definite false short-circuits over the unknown.
        let and_false = Condition::And {
            conditions: vec![
                missing,
                Condition::Eq {
                    attribute: "action".into(),
                    value: json!("write"),
                },
            ],
        };
        assert_eq!(and_false.evaluate(&attrs), TriState::False);
    }

    #[test]
    fn contains_handles_arrays_and_strings() {
        let attrs = bag(&["user", "auditor"]);
        let roles_contains = Condition::Contains {
            attribute: "subject.roles".into(),
            value: json!("auditor"),
        };
        assert_eq!(roles_contains.evaluate(&attrs), TriState::True);

        let substring = Condition::Contains {
            attribute: "subject.department".into(),
            value: json!("engineer"),
        };
        assert_eq!(substring.evaluate(&attrs), TriState::True);

        let type_mismatch = Condition::Contains {
            attribute: "subject.clearance".into(),
            value: json!(1),
        };
        assert_eq!(type_mismatch.evaluate(&attrs), TriState::Unknown);
    }

    #[test]
    fn not_flips_and_preserves_unknown() {
        let attrs = bag(&["user"]);
        let not_true = Condition::Not {
            condition: Box::new(Condition::Present {
                attribute: "subject.id".into(),
            }),
        };
        assert_eq!(not_true.evaluate(&attrs), TriState::False);

        let not_unknown = Condition::Not {
            condition: Box::new(Condition::Eq {
                attribute: "context.ip".into(),
                value: json!("x"),
            }),
        };
        assert_eq!(not_unknown.evaluate(&attrs), TriState::Unknown);
    }

    #[test]
    fn condition_tree_parses_from_tagged_json() {
        let raw = json!({
            "op": "and",
            "conditions": [
                {"op": "eq", "attribute": "action", "value": "read"},
                {"op": "in", "attribute": "subject.department",
                 "values": ["engineering", "support"]}
            ]
        });
        let condition: Condition = serde_json::from_value(raw).expect("parse condition");
        assert_eq!(condition.evaluate(&bag(&["user"])), TriState::True);
    }
}
