//! Authorization request and decision DTOs plus the attribute bag consumed
//! by condition evaluation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

/// The caller being authorized. Attributes travel with the request so the
/// engine never reaches into the authentication service's database.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubjectDescriptor {
    pub id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
/// A single authorization question: may `subject` perform `action` on `resource`?
pub struct AuthorizeRequest {
    pub subject: SubjectDescriptor,
    pub resource: String,
    pub action: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
/// One entry of a bulk authorization call; the subject is shared.
pub struct BulkEntry {
    pub resource: String,
    pub action: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BulkAuthorizeRequest {
    pub subject: SubjectDescriptor,
    pub entries: Vec<BulkEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Outcome of reducing all policy effects for one request.
pub enum DecisionEffect {
    Permit,
    Deny,
    Indeterminate,
}

impl DecisionEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionEffect::Permit => "permit",
            DecisionEffect::Deny => "deny",
            DecisionEffect::Indeterminate => "indeterminate",
        }
    }
}

impl Serialize for DecisionEffect {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DecisionEffect {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.as_str() {
            "permit" => Ok(DecisionEffect::Permit),
            "deny" => Ok(DecisionEffect::Deny),
            "indeterminate" => Ok(DecisionEffect::Indeterminate),
            other => Err(serde::de::Error::unknown_variant(
                other,
                &["permit", "deny", "indeterminate"],
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
/// The result of one authorize call. Always audited.
pub struct Decision {
    pub fingerprint: String,
    pub effect: DecisionEffect,
    pub reason: String,
    /// Policies that contributed to the final effect.
    pub matched_policies: Vec<String>,
    pub evaluation_ms: f64,
    pub cache_hit: bool,
    pub obligations: Vec<Value>,
    pub advice: Vec<Value>,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
/// Wire shape of a single authorize response.
pub struct DecisionResponse {
    pub decision: Decision,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
/// Permit/deny/indeterminate counts for a bulk call.
pub struct BulkSummary {
    pub total: usize,
    pub permitted: usize,
    pub denied: usize,
    pub indeterminate: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BulkAuthorizeResponse {
    /// Decisions in the same order as the request entries.
    pub results: Vec<Decision>,
    pub summary: BulkSummary,
}

impl BulkSummary {
    pub fn tally(decisions: &[Decision]) -> Self {
        let mut summary = BulkSummary {
            total: decisions.len(),
            ..Default::default()
        };
        for decision in decisions {
            match decision.effect {
                DecisionEffect::Permit => summary.permitted += 1,
                DecisionEffect::Deny => summary.denied += 1,
                DecisionEffect::Indeterminate => summary.indeterminate += 1,
            }
        }
        summary
    }
}

/// Flattened attribute view over one authorization request.
///
/// Keys follow the `subject.*` / `context.*` / `resource` / `action` naming
/// that policy conditions reference.
#[derive(Debug, Clone, Default)]
pub struct AttributeBag(Map<String, Value>);

impl AttributeBag {
    pub fn from_request(
        subject: &SubjectDescriptor,
        resource: &str,
        action: &str,
        context: &Map<String, Value>,
    ) -> Self {
        let mut attrs = Map::new();
        attrs.insert("subject.id".to_string(), Value::String(subject.id.clone()));
        attrs.insert(
            "subject.roles".to_string(),
            Value::Array(
                subject
                    .roles
                    .iter()
                    .map(|role| Value::String(role.clone()))
                    .collect(),
            ),
        );
        for (key, value) in &subject.attributes {
            attrs.insert(format!("subject.{key}"), value.clone());
        }
        attrs.insert("resource".to_string(), Value::String(resource.to_string()));
        attrs.insert("action".to_string(), Value::String(action.to_string()));
        for (key, value) in context {
            attrs.insert(format!("context.{key}"), value.clone());
        }
        Self(attrs)
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.0.get(attribute)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn subject() -> SubjectDescriptor {
        let mut attributes = Map::new();
        attributes.insert("department".into(), json!("engineering"));
        SubjectDescriptor {
            id: "alice".into(),
            roles: vec!["user".into()],
            attributes,
        }
    }

    #[test]
    fn attribute_bag_flattens_request_parts() {
        let mut context = Map::new();
        context.insert("ip".into(), json!("10.0.0.1"));
        let bag = AttributeBag::from_request(&subject(), "doc1", "read", &context);

        assert_eq!(bag.get("subject.id"), Some(&json!("alice")));
        assert_eq!(bag.get("subject.department"), Some(&json!("engineering")));
        assert_eq!(bag.get("resource"), Some(&json!("doc1")));
        assert_eq!(bag.get("action"), Some(&json!("read")));
        assert_eq!(bag.get("context.ip"), Some(&json!("10.0.0.1")));
        assert!(bag.get("context.missing").is_none());
    }

    #[test]
    fn decision_effect_round_trips() {
        for effect in [
            DecisionEffect::Permit,
            DecisionEffect::Deny,
            DecisionEffect::Indeterminate,
        ] {
            let text = serde_json::to_string(&effect).unwrap();
            let back: DecisionEffect = serde_json::from_str(&text).unwrap();
            assert_eq!(effect, back);
        }
    }

    #[test]
    fn bulk_summary_counts_each_effect() {
        let decision = |effect| Decision {
            fingerprint: "fp".into(),
            effect,
            reason: String::new(),
            matched_policies: Vec::new(),
            evaluation_ms: 0.0,
            cache_hit: false,
            obligations: Vec::new(),
            advice: Vec::new(),
            timestamp: Utc::now(),
            request_id: "req".into(),
        };
        let decisions = vec![
            decision(DecisionEffect::Permit),
            decision(DecisionEffect::Permit),
            decision(DecisionEffect::Deny),
            decision(DecisionEffect::Indeterminate),
        ];
        let summary = BulkSummary::tally(&decisions);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.permitted, 2);
        assert_eq!(summary.denied, 1);
        assert_eq!(summary.indeterminate, 1);
    }
}
