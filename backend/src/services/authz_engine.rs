//! The policy decision point: matching, combining, caching, coalescing, and
//! bulk evaluation.

use chrono::Utc;
use moka::future::Cache;
use rand::Rng;
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::AuthzConfig;
use crate::error::AppError;
use crate::models::audit::AuditRecord;
use crate::models::decision::{
    AttributeBag, AuthorizeRequest, BulkAuthorizeRequest, BulkAuthorizeResponse, BulkSummary,
    Decision, DecisionEffect, SubjectDescriptor,
};
use crate::models::policy::{Effect, Policy, TriState};
use crate::repositories::policy as policy_repo;
use crate::services::audit_sink::AuditSink;
use crate::utils::fingerprint::canonical_fingerprint;

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait PolicyProvider: Send + Sync {
    /// The highest active version of every policy.
    async fn load_active_policies(&self) -> anyhow::Result<Vec<Policy>>;
}

pub struct PgPolicyProvider {
    pool: PgPool,
}

impl PgPolicyProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl PolicyProvider for PgPolicyProvider {
    async fn load_active_policies(&self) -> anyhow::Result<Vec<Policy>> {
        Ok(policy_repo::load_active_policies(&self.pool).await?)
    }
}

/// Stable fingerprint of a normalized authorization tuple.
pub fn fingerprint_request(
    subject: &SubjectDescriptor,
    resource: &str,
    action: &str,
    context: &Map<String, Value>,
) -> String {
    let mut roles: Vec<&str> = subject.roles.iter().map(String::as_str).collect();
    roles.sort_unstable();
    roles.dedup();
    let normalized = json!({
        "subject": {
            "id": subject.id,
            "roles": roles,
            "attributes": subject.attributes,
        },
        "resource": resource,
        "action": action,
        "context": context,
    });
    canonical_fingerprint(&normalized)
}

/// Result of reducing the policy set for one request, before timing and
/// transport fields are attached.
#[derive(Debug, Clone)]
pub struct CombinedOutcome {
    pub effect: DecisionEffect,
    pub reason: String,
    pub matched_policies: Vec<String>,
    pub obligations: Vec<Value>,
    pub advice: Vec<Value>,
}

/// Deny-overrides-with-priority combining.
///
/// Matching policies are walked in descending priority groups. Within one
/// group a definite deny beats a definite permit; the first group producing a
/// definitive effect decides. A request matching only indeterminate policies
/// is indeterminate; matching nothing applicable falls back to the configured
/// default effect.
pub fn combine_decision(
    policies: &[Policy],
    subject: &SubjectDescriptor,
    resource: &str,
    action: &str,
    context: &Map<String, Value>,
    default_effect: Effect,
) -> CombinedOutcome {
    let attrs = AttributeBag::from_request(subject, resource, action, context);

    let mut matching: Vec<&Policy> = policies
        .iter()
        .filter(|policy| {
            policy.is_active
                && policy
                    .target
                    .matches(&subject.id, &subject.roles, resource, action)
        })
        .collect();
    // Priority descending, then recency, then id for a deterministic walk
    // when priority and timestamp tie.
    matching.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(b.updated_at.cmp(&a.updated_at))
            .then(a.id.to_string().cmp(&b.id.to_string()))
    });

    let matched_total = matching.len();
    let mut indeterminate_ids: Vec<String> = Vec::new();
    let mut indeterminate_total = 0usize;

    let mut index = 0;
    while index < matching.len() {
        let priority = matching[index].priority;
        let mut denies: Vec<&Policy> = Vec::new();
        let mut permits: Vec<&Policy> = Vec::new();

        while index < matching.len() && matching[index].priority == priority {
            let policy = matching[index];
            match policy.applies(&attrs) {
                TriState::True => match policy.effect {
                    Effect::Deny => denies.push(policy),
                    Effect::Permit => permits.push(policy),
                },
                TriState::Unknown => {
                    indeterminate_total += 1;
                    indeterminate_ids.push(policy.id.to_string());
                }
                TriState::False => {}
            }
            index += 1;
        }

        if !denies.is_empty() {
            return outcome_for(DecisionEffect::Deny, &denies);
        }
        if !permits.is_empty() {
            return outcome_for(DecisionEffect::Permit, &permits);
        }
    }

    if matched_total > 0 && indeterminate_total == matched_total {
        return CombinedOutcome {
            effect: DecisionEffect::Indeterminate,
            reason: "all matching policies evaluated indeterminate".to_string(),
            matched_policies: indeterminate_ids,
            obligations: Vec::new(),
            advice: Vec::new(),
        };
    }

    let effect = match default_effect {
        Effect::Permit => DecisionEffect::Permit,
        Effect::Deny => DecisionEffect::Deny,
    };
    CombinedOutcome {
        effect,
        reason: format!("no applicable policy; default effect {}", effect.as_str()),
        matched_policies: Vec::new(),
        obligations: Vec::new(),
        advice: Vec::new(),
    }
}

fn outcome_for(effect: DecisionEffect, contributors: &[&Policy]) -> CombinedOutcome {
    let matched_policies = contributors.iter().map(|p| p.id.to_string()).collect();
    let obligations = contributors
        .iter()
        .flat_map(|p| p.obligations.0.iter().cloned())
        .collect();
    let advice = contributors
        .iter()
        .flat_map(|p| p.advice.0.iter().cloned())
        .collect();
    let reason = match effect {
        DecisionEffect::Deny => format!(
            "explicit deny by {}",
            contributors
                .iter()
                .map(|p| p.id.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
        _ => format!("permitted by {} matching policy(ies)", contributors.len()),
    };
    CombinedOutcome {
        effect,
        reason,
        matched_policies,
        obligations,
        advice,
    }
}

#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub total: AtomicU64,
    pub cache_hits: AtomicU64,
    pub permits: AtomicU64,
    pub denies: AtomicU64,
    pub indeterminates: AtomicU64,
    pub eval_micros: AtomicU64,
}

impl EngineMetrics {
    fn record(&self, decision: &Decision) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if decision.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        match decision.effect {
            DecisionEffect::Permit => self.permits.fetch_add(1, Ordering::Relaxed),
            DecisionEffect::Deny => self.denies.fetch_add(1, Ordering::Relaxed),
            DecisionEffect::Indeterminate => self.indeterminates.fetch_add(1, Ordering::Relaxed),
        };
        self.eval_micros.fetch_add(
            (decision.evaluation_ms * 1000.0) as u64,
            Ordering::Relaxed,
        );
    }

    fn snapshot(&self) -> Value {
        let total = self.total.load(Ordering::Relaxed);
        let eval_micros = self.eval_micros.load(Ordering::Relaxed);
        let avg_ms = if total > 0 {
            (eval_micros as f64 / total as f64) / 1000.0
        } else {
            0.0
        };
        json!({
            "total_decisions": total,
            "cache_hits": self.cache_hits.load(Ordering::Relaxed),
            "permits": self.permits.load(Ordering::Relaxed),
            "denies": self.denies.load(Ordering::Relaxed),
            "indeterminates": self.indeterminates.load(Ordering::Relaxed),
            "avg_evaluation_ms": avg_ms,
        })
    }
}

const STORE_RETRY_ATTEMPTS: u32 = 3;

pub struct AuthzEngine {
    provider: Arc<dyn PolicyProvider>,
    audit: AuditSink,
    config: AuthzConfig,
    cache: Cache<String, Decision>,
    /// In-flight evaluations keyed by fingerprint. A second caller joins the
    /// existing computation instead of duplicating policy evaluation.
    inflight: Mutex<HashMap<String, watch::Receiver<Option<Decision>>>>,
    metrics: EngineMetrics,
}

enum FlightRole {
    Leader(watch::Sender<Option<Decision>>),
    Joiner(watch::Receiver<Option<Decision>>),
}

impl AuthzEngine {
    pub fn new(provider: Arc<dyn PolicyProvider>, audit: AuditSink, config: AuthzConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.decision_cache_capacity)
            .time_to_live(Duration::from_secs(config.decision_cache_ttl_secs.max(1)))
            .build();
        Self {
            provider,
            audit,
            config,
            cache,
            inflight: Mutex::new(HashMap::new()),
            metrics: EngineMetrics::default(),
        }
    }

    /// Evaluates one request, consulting the decision cache and coalescing
    /// concurrent identical requests onto a single evaluation.
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        request_id: &str,
    ) -> Result<Decision, AppError> {
        let fingerprint = fingerprint_request(
            &request.subject,
            &request.resource,
            &request.action,
            &request.context,
        );

        if let Some(cached) = self.cache.get(&fingerprint).await {
            let mut decision = cached;
            decision.cache_hit = true;
            decision.timestamp = Utc::now();
            decision.request_id = request_id.to_string();
            self.finish(&request.subject, &request.resource, &request.action, &decision);
            return Ok(decision);
        }

        let role = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
            match inflight.get(&fingerprint) {
                Some(rx) => FlightRole::Joiner(rx.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(fingerprint.clone(), rx);
                    FlightRole::Leader(tx)
                }
            }
        };

        match role {
            FlightRole::Leader(tx) => {
                let result = self.evaluate_fresh(request, &fingerprint, request_id).await;
                {
                    let mut inflight = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                    inflight.remove(&fingerprint);
                }
                if let Ok(decision) = &result {
                    let _ = tx.send(Some(decision.clone()));
                }
                // On error the sender drops and joiners re-evaluate themselves.
                result
            }
            FlightRole::Joiner(mut rx) => {
                let started = Instant::now();
                loop {
                    let shared = rx.borrow_and_update().clone();
                    if let Some(mut decision) = shared {
                        decision.cache_hit = false;
                        decision.evaluation_ms = elapsed_ms(started);
                        decision.timestamp = Utc::now();
                        decision.request_id = request_id.to_string();
                        self.finish(&request.subject, &request.resource, &request.action, &decision);
                        return Ok(decision);
                    }
                    if rx.changed().await.is_err() {
                        // The leader was cancelled before publishing; clear the
                        // dead flight so later callers lead again.
                        {
                            let mut inflight =
                                self.inflight.lock().unwrap_or_else(|e| e.into_inner());
                            if inflight
                                .get(&fingerprint)
                                .map(|entry| entry.has_changed().is_err())
                                .unwrap_or(false)
                            {
                                inflight.remove(&fingerprint);
                            }
                        }
                        return self.evaluate_fresh(request, &fingerprint, request_id).await;
                    }
                }
            }
        }
    }

    async fn evaluate_fresh(
        &self,
        request: &AuthorizeRequest,
        fingerprint: &str,
        request_id: &str,
    ) -> Result<Decision, AppError> {
        let started = Instant::now();
        let policies = self.load_policies().await?;
        let outcome = combine_decision(
            &policies,
            &request.subject,
            &request.resource,
            &request.action,
            &request.context,
            self.config.default_effect,
        );

        let decision = Decision {
            fingerprint: fingerprint.to_string(),
            effect: outcome.effect,
            reason: outcome.reason,
            matched_policies: outcome.matched_policies,
            evaluation_ms: elapsed_ms(started),
            cache_hit: false,
            obligations: outcome.obligations,
            advice: outcome.advice,
            timestamp: Utc::now(),
            request_id: request_id.to_string(),
        };

        self.cache.insert(fingerprint.to_string(), decision.clone()).await;
        self.finish(&request.subject, &request.resource, &request.action, &decision);
        Ok(decision)
    }

    async fn load_policies(&self) -> Result<Vec<Policy>, AppError> {
        let mut delay = Duration::from_millis(50);
        for attempt in 0..STORE_RETRY_ATTEMPTS {
            match self.provider.load_active_policies().await {
                Ok(policies) => return Ok(policies),
                Err(err) if attempt + 1 == STORE_RETRY_ATTEMPTS => {
                    tracing::error!(error = ?err, "Policy load failed after retries");
                    return Err(AppError::Unavailable(
                        "Policy store unavailable".to_string(),
                    ));
                }
                Err(err) => {
                    tracing::warn!(error = ?err, attempt, "Policy load failed; retrying");
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay *= 2;
                }
            }
        }
        unreachable!("retry loop always returns")
    }

    /// Bulk authorize: dedups identical entries by fingerprint, evaluates the
    /// unique ones with bounded concurrency, and returns results in input
    /// order. Canceling the caller drops the `JoinSet` and aborts children.
    pub async fn authorize_bulk(
        self: Arc<Self>,
        request: BulkAuthorizeRequest,
        request_id: &str,
    ) -> Result<BulkAuthorizeResponse, AppError> {
        let fingerprints: Vec<String> = request
            .entries
            .iter()
            .map(|entry| {
                fingerprint_request(&request.subject, &entry.resource, &entry.action, &entry.context)
            })
            .collect();

        let mut unique: HashMap<String, usize> = HashMap::new();
        for (index, fingerprint) in fingerprints.iter().enumerate() {
            unique.entry(fingerprint.clone()).or_insert(index);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.bulk_concurrency));
        let mut tasks: JoinSet<(String, Result<Decision, AppError>)> = JoinSet::new();
        for (fingerprint, index) in unique {
            let engine = Arc::clone(&self);
            let subject = request.subject.clone();
            let entry = request.entries[index].clone();
            let semaphore = Arc::clone(&semaphore);
            let request_id = request_id.to_string();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let authorize_request = AuthorizeRequest {
                    subject,
                    resource: entry.resource,
                    action: entry.action,
                    context: entry.context,
                };
                let result = engine.authorize(&authorize_request, &request_id).await;
                (fingerprint, result)
            });
        }

        let mut decisions: HashMap<String, Decision> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (fingerprint, result) =
                joined.map_err(|e| AppError::InternalServerError(e.into()))?;
            let decision = match result {
                Ok(decision) => decision,
                // A failed sub-evaluation surfaces as an indeterminate entry
                // rather than failing the whole batch.
                Err(_) => indeterminate_decision(&fingerprint, request_id),
            };
            decisions.insert(fingerprint, decision);
        }

        let mut results = Vec::with_capacity(fingerprints.len());
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for fingerprint in &fingerprints {
            let mut decision = decisions
                .get(fingerprint.as_str())
                .cloned()
                .unwrap_or_else(|| indeterminate_decision(fingerprint, request_id));
            if seen.insert(fingerprint.as_str(), ()).is_some() {
                // Duplicate entries rode the in-flight evaluation for free.
                decision.evaluation_ms = 0.0;
            }
            results.push(decision);
        }

        let summary = BulkSummary::tally(&results);
        Ok(BulkAuthorizeResponse { results, summary })
    }

    /// Batch-optimized variant: loads the policy set once, pre-filters it by
    /// the subject's roles, and evaluates entries against the reduced set.
    pub async fn authorize_batch_optimized(
        self: Arc<Self>,
        request: BulkAuthorizeRequest,
        request_id: &str,
    ) -> Result<BulkAuthorizeResponse, AppError> {
        let policies = self.load_policies().await?;
        let filtered: Arc<Vec<Policy>> = Arc::new(
            policies
                .into_iter()
                .filter(|policy| policy.target.could_apply_to_roles(&request.subject.roles))
                .collect(),
        );

        let fingerprints: Vec<String> = request
            .entries
            .iter()
            .map(|entry| {
                fingerprint_request(&request.subject, &entry.resource, &entry.action, &entry.context)
            })
            .collect();

        let mut unique: HashMap<String, usize> = HashMap::new();
        for (index, fingerprint) in fingerprints.iter().enumerate() {
            unique.entry(fingerprint.clone()).or_insert(index);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.bulk_concurrency));
        let mut tasks: JoinSet<(String, Decision)> = JoinSet::new();
        for (fingerprint, index) in unique {
            let engine = Arc::clone(&self);
            let policies = Arc::clone(&filtered);
            let subject = request.subject.clone();
            let entry = request.entries[index].clone();
            let semaphore = Arc::clone(&semaphore);
            let request_id = request_id.to_string();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let started = Instant::now();
                let outcome = combine_decision(
                    &policies,
                    &subject,
                    &entry.resource,
                    &entry.action,
                    &entry.context,
                    engine.config.default_effect,
                );
                let decision = Decision {
                    fingerprint: fingerprint.clone(),
                    effect: outcome.effect,
                    reason: outcome.reason,
                    matched_policies: outcome.matched_policies,
                    evaluation_ms: elapsed_ms(started),
                    cache_hit: false,
                    obligations: outcome.obligations,
                    advice: outcome.advice,
                    timestamp: Utc::now(),
                    request_id,
                };
                engine.cache.insert(fingerprint.clone(), decision.clone()).await;
                engine.finish(&subject, &entry.resource, &entry.action, &decision);
                (fingerprint, decision)
            });
        }

        let mut decisions: HashMap<String, Decision> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let (fingerprint, decision) =
                joined.map_err(|e| AppError::InternalServerError(e.into()))?;
            decisions.insert(fingerprint, decision);
        }

        let mut results = Vec::with_capacity(fingerprints.len());
        let mut seen: HashMap<&str, ()> = HashMap::new();
        for fingerprint in &fingerprints {
            let mut decision = decisions
                .get(fingerprint.as_str())
                .cloned()
                .unwrap_or_else(|| indeterminate_decision(fingerprint, request_id));
            if seen.insert(fingerprint.as_str(), ()).is_some() {
                decision.evaluation_ms = 0.0;
            }
            results.push(decision);
        }

        let summary = BulkSummary::tally(&results);
        Ok(BulkAuthorizeResponse { results, summary })
    }

    /// Replays the configured common tuples so the first real callers hit a
    /// warm cache.
    pub async fn warm_cache(&self) -> Result<usize, AppError> {
        let tuples: Vec<AuthorizeRequest> = serde_json::from_str(&self.config.warm_cache_tuples)
            .map_err(|e| AppError::BadRequest(format!("Invalid warm-cache tuples: {e}")))?;
        let count = tuples.len();
        for request in &tuples {
            self.authorize(request, "warm-cache").await?;
        }
        Ok(count)
    }

    /// Drops every cached decision. Called after any policy mutation commits,
    /// so no new decision uses the prior policy version.
    pub fn invalidate_cache(&self) {
        self.cache.invalidate_all();
    }

    pub fn cached_decisions(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn metrics_snapshot(&self) -> Value {
        let mut snapshot = self.metrics.snapshot();
        snapshot["cached_decisions"] = json!(self.cache.entry_count());
        snapshot
    }

    fn finish(&self, subject: &SubjectDescriptor, resource: &str, action: &str, decision: &Decision) {
        self.metrics.record(decision);
        self.audit.write(AuditRecord::new(
            Some(subject.id.clone()),
            "authorize",
            decision.effect == DecisionEffect::Permit,
            Some(json!({
                "fingerprint": decision.fingerprint,
                "effect": decision.effect.as_str(),
                "resource": resource,
                "action": action,
                "matched_policies": decision.matched_policies,
                "evaluation_ms": decision.evaluation_ms,
                "cache_hit": decision.cache_hit,
                "request_id": decision.request_id,
            })),
        ));
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

fn indeterminate_decision(fingerprint: &str, request_id: &str) -> Decision {
    Decision {
        fingerprint: fingerprint.to_string(),
        effect: DecisionEffect::Indeterminate,
        reason: "evaluation error".to_string(),
        matched_policies: Vec::new(),
        evaluation_ms: 0.0,
        cache_hit: false,
        obligations: Vec::new(),
        advice: Vec::new(),
        timestamp: Utc::now(),
        request_id: request_id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::decision::BulkEntry;
    use crate::models::policy::{PolicyTarget, TargetPredicate};
    use crate::services::audit_sink::{AuditSink, AuditStoreTrait};
    use crate::types::PolicyId;
    use sqlx::types::Json;
    use std::sync::atomic::AtomicUsize;

    struct NullAuditStore;

    #[async_trait::async_trait]
    impl AuditStoreTrait for NullAuditStore {
        async fn insert_record(&self, _record: AuditRecord) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Hand-rolled provider that counts loads and can delay, for coalescing
    /// and invalidation tests.
    struct CountingProvider {
        policies: Mutex<Vec<Policy>>,
        loads: AtomicUsize,
        delay: Duration,
    }

    impl CountingProvider {
        fn new(policies: Vec<Policy>) -> Self {
            Self {
                policies: Mutex::new(policies),
                loads: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn set_policies(&self, policies: Vec<Policy>) {
            *self.policies.lock().unwrap() = policies;
        }

        fn load_count(&self) -> usize {
            self.loads.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl PolicyProvider for CountingProvider {
        async fn load_active_policies(&self) -> anyhow::Result<Vec<Policy>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            Ok(self.policies.lock().unwrap().clone())
        }
    }

    fn test_config() -> AuthzConfig {
        AuthzConfig {
            host: "127.0.0.1".into(),
            port: 8002,
            workers: None,
            database_url: "postgres://localhost/test".into(),
            decision_cache_ttl_secs: 60,
            decision_cache_capacity: 128,
            default_effect: Effect::Deny,
            bulk_concurrency: 4,
            warm_cache_tuples: "[]".into(),
            audit_queue_capacity: 64,
            alert_failed_threshold: 5,
            alert_window_minutes: 15,
        }
    }

    fn policy(effect: Effect, priority: i32, resources: &[&str]) -> Policy {
        let now = Utc::now();
        Policy {
            id: PolicyId::new(),
            version: 1,
            effect,
            target: Json(PolicyTarget {
                subjects: TargetPredicate::wildcard(),
                resources: TargetPredicate(resources.iter().map(|r| r.to_string()).collect()),
                actions: TargetPredicate::wildcard(),
            }),
            condition: None,
            obligations: Json(Vec::new()),
            advice: Json(Vec::new()),
            priority,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    fn subject(id: &str, roles: &[&str]) -> SubjectDescriptor {
        SubjectDescriptor {
            id: id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
            attributes: Map::new(),
        }
    }

    fn request(resource: &str, action: &str) -> AuthorizeRequest {
        AuthorizeRequest {
            subject: subject("alice", &["user"]),
            resource: resource.into(),
            action: action.into(),
            context: Map::new(),
        }
    }

    fn engine_with(provider: Arc<dyn PolicyProvider>) -> Arc<AuthzEngine> {
        let audit = AuditSink::spawn(Arc::new(NullAuditStore), 64);
        Arc::new(AuthzEngine::new(provider, audit, test_config()))
    }

    #[test]
    fn higher_priority_permit_beats_lower_priority_deny() {
        let permit = policy(Effect::Permit, 10, &["doc1"]);
        let mut deny = policy(Effect::Deny, 5, &["doc1"]);
        let policies = vec![permit.clone(), deny.clone()];

        let outcome = combine_decision(
            &policies,
            &subject("alice", &[]),
            "doc1",
            "read",
            &Map::new(),
            Effect::Deny,
        );
        assert_eq!(outcome.effect, DecisionEffect::Permit);
        assert_eq!(outcome.matched_policies, vec![permit.id.to_string()]);

        // Raising the deny's priority flips the decision.
        deny.priority = 20;
        let outcome = combine_decision(
            &[permit, deny.clone()],
            &subject("alice", &[]),
            "doc1",
            "read",
            &Map::new(),
            Effect::Deny,
        );
        assert_eq!(outcome.effect, DecisionEffect::Deny);
        assert_eq!(outcome.matched_policies, vec![deny.id.to_string()]);
    }

    #[test]
    fn deny_overrides_permit_at_equal_priority() {
        let permit = policy(Effect::Permit, 10, &["doc1"]);
        let deny = policy(Effect::Deny, 10, &["doc1"]);
        let outcome = combine_decision(
            &[permit, deny.clone()],
            &subject("alice", &[]),
            "doc1",
            "read",
            &Map::new(),
            Effect::Permit,
        );
        assert_eq!(outcome.effect, DecisionEffect::Deny);
        assert!(outcome.reason.contains(&deny.id.to_string()));
    }

    #[test]
    fn unmatched_request_gets_default_effect() {
        let policies = vec![policy(Effect::Permit, 0, &["doc1"])];
        let outcome = combine_decision(
            &policies,
            &subject("alice", &[]),
            "other",
            "read",
            &Map::new(),
            Effect::Deny,
        );
        assert_eq!(outcome.effect, DecisionEffect::Deny);
        assert!(outcome.matched_policies.is_empty());

        let outcome = combine_decision(
            &policies,
            &subject("alice", &[]),
            "other",
            "read",
            &Map::new(),
            Effect::Permit,
        );
        assert_eq!(outcome.effect, DecisionEffect::Permit);
    }

    #[test]
    fn all_indeterminate_matches_yield_indeterminate() {
        let mut p = policy(Effect::Permit, 0, &["doc1"]);
        p.condition = Some(Json(crate::models::policy::Condition::Eq {
            attribute: "context.tenant".into(),
            value: json!("acme"),
        }));
        let outcome = combine_decision(
            &[p],
            &subject("alice", &[]),
            "doc1",
            "read",
            &Map::new(),
            Effect::Deny,
        );
        assert_eq!(outcome.effect, DecisionEffect::Indeterminate);
        assert_eq!(outcome.matched_policies.len(), 1);
    }

    #[test]
    fn inactive_policies_never_contribute() {
        let mut p = policy(Effect::Deny, 100, &["doc1"]);
        p.is_active = false;
        let outcome = combine_decision(
            &[p],
            &subject("alice", &[]),
            "doc1",
            "read",
            &Map::new(),
            Effect::Permit,
        );
        assert_eq!(outcome.effect, DecisionEffect::Permit);
    }

    #[test]
    fn obligations_aggregate_from_contributing_policies() {
        let mut a = policy(Effect::Permit, 5, &["doc1"]);
        a.obligations = Json(vec![json!({"log": "a"})]);
        let mut b = policy(Effect::Permit, 5, &["doc1"]);
        b.advice = Json(vec![json!({"hint": "b"})]);
        let outcome = combine_decision(
            &[a, b],
            &subject("alice", &[]),
            "doc1",
            "read",
            &Map::new(),
            Effect::Deny,
        );
        assert_eq!(outcome.effect, DecisionEffect::Permit);
        assert_eq!(outcome.obligations.len(), 1);
        assert_eq!(outcome.advice.len(), 1);
        assert_eq!(outcome.matched_policies.len(), 2);
    }

    #[test]
    fn fingerprint_normalizes_role_order() {
        let a = subject("alice", &["admin", "user"]);
        let b = subject("alice", &["user", "admin", "user"]);
        let context = Map::new();
        assert_eq!(
            fingerprint_request(&a, "doc1", "read", &context),
            fingerprint_request(&b, "doc1", "read", &context)
        );
    }

    #[tokio::test]
    async fn repeated_requests_hit_the_decision_cache() {
        let provider = Arc::new(CountingProvider::new(vec![policy(
            Effect::Permit,
            0,
            &["doc1"],
        )]));
        let engine = engine_with(provider.clone());

        let first = engine.authorize(&request("doc1", "read"), "req-1").await.unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.effect, DecisionEffect::Permit);

        let second = engine.authorize(&request("doc1", "read"), "req-2").await.unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.effect, first.effect);
        assert_eq!(second.fingerprint, first.fingerprint);
        assert_eq!(provider.load_count(), 1);
    }

    #[tokio::test]
    async fn policy_mutation_invalidates_every_cached_decision() {
        let provider = Arc::new(CountingProvider::new(vec![policy(
            Effect::Permit,
            0,
            &["doc1"],
        )]));
        let engine = engine_with(provider.clone());

        let before = engine.authorize(&request("doc1", "read"), "req-1").await.unwrap();
        assert_eq!(before.effect, DecisionEffect::Permit);

        provider.set_policies(vec![policy(Effect::Deny, 0, &["doc1"])]);
        engine.invalidate_cache();

        let after = engine.authorize(&request("doc1", "read"), "req-2").await.unwrap();
        assert!(!after.cache_hit);
        assert_eq!(after.effect, DecisionEffect::Deny);
        assert_eq!(provider.load_count(), 2);
    }

    #[tokio::test]
    async fn concurrent_identical_requests_share_one_evaluation() {
        let provider = Arc::new(
            CountingProvider::new(vec![policy(Effect::Permit, 0, &["doc1"])])
                .with_delay(Duration::from_millis(100)),
        );
        let engine = engine_with(provider.clone());

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.authorize(&request("doc1", "read"), "req-a").await })
        };
        // Give the leader a head start so the second call joins the flight.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.authorize(&request("doc1", "read"), "req-b").await })
        };

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(first.effect, second.effect);
        assert_eq!(first.fingerprint, second.fingerprint);
        assert_eq!(provider.load_count(), 1);
    }

    #[tokio::test]
    async fn bulk_dedupes_and_preserves_input_order() {
        let provider = Arc::new(CountingProvider::new(vec![
            policy(Effect::Permit, 0, &["doc1"]),
            policy(Effect::Deny, 0, &["doc2"]),
        ]));
        let engine = engine_with(provider.clone());

        let entry = |resource: &str| BulkEntry {
            resource: resource.into(),
            action: "read".into(),
            context: Map::new(),
        };
        let bulk = BulkAuthorizeRequest {
            subject: subject("alice", &["user"]),
            entries: vec![entry("doc1"), entry("doc1"), entry("doc2"), entry("doc1")],
        };

        let response = engine.clone().authorize_bulk(bulk, "req-bulk").await.unwrap();
        assert_eq!(response.results.len(), 4);
        assert_eq!(response.results[0].effect, DecisionEffect::Permit);
        assert_eq!(response.results[1].effect, DecisionEffect::Permit);
        assert_eq!(response.results[2].effect, DecisionEffect::Deny);
        assert_eq!(response.results[3].effect, DecisionEffect::Permit);
        assert_eq!(response.summary.total, 4);
        assert_eq!(response.summary.permitted, 3);
        assert_eq!(response.summary.denied, 1);
        // Two unique fingerprints, one policy load each at most.
        assert!(provider.load_count() <= 2);
        // Duplicates ride the shared evaluation.
        assert_eq!(response.results[1].evaluation_ms, 0.0);
        assert_eq!(response.results[3].evaluation_ms, 0.0);
    }

    #[tokio::test]
    async fn batch_optimized_loads_policies_once() {
        let provider = Arc::new(CountingProvider::new(vec![
            policy(Effect::Permit, 0, &["doc1"]),
            policy(Effect::Permit, 0, &["doc2"]),
        ]));
        let engine = engine_with(provider.clone());

        let entry = |resource: &str| BulkEntry {
            resource: resource.into(),
            action: "read".into(),
            context: Map::new(),
        };
        let bulk = BulkAuthorizeRequest {
            subject: subject("alice", &["user"]),
            entries: vec![entry("doc1"), entry("doc2"), entry("doc3")],
        };

        let response = engine
            .clone()
            .authorize_batch_optimized(bulk, "req-batch")
            .await
            .unwrap();
        assert_eq!(provider.load_count(), 1);
        assert_eq!(response.results[0].effect, DecisionEffect::Permit);
        assert_eq!(response.results[1].effect, DecisionEffect::Permit);
        assert_eq!(response.results[2].effect, DecisionEffect::Deny);
    }

    #[tokio::test]
    async fn bulk_and_single_agree() {
        let provider = Arc::new(CountingProvider::new(vec![policy(
            Effect::Permit,
            0,
            &["doc1"],
        )]));
        let engine = engine_with(provider);

        let single = engine.authorize(&request("doc1", "read"), "req-1").await.unwrap();
        let bulk = BulkAuthorizeRequest {
            subject: subject("alice", &["user"]),
            entries: vec![
                BulkEntry {
                    resource: "doc1".into(),
                    action: "read".into(),
                    context: Map::new(),
                };
                3
            ],
        };
        let response = engine.clone().authorize_bulk(bulk, "req-2").await.unwrap();
        for decision in &response.results {
            assert_eq!(decision.effect, single.effect);
            assert_eq!(decision.fingerprint, single.fingerprint);
        }
    }

    #[tokio::test]
    async fn store_failure_surfaces_as_unavailable() {
        struct FailingProvider;
        #[async_trait::async_trait]
        impl PolicyProvider for FailingProvider {
            async fn load_active_policies(&self) -> anyhow::Result<Vec<Policy>> {
                Err(anyhow::anyhow!("connection refused"))
            }
        }
        let engine = engine_with(Arc::new(FailingProvider));
        let err = engine.authorize(&request("doc1", "read"), "req-1").await;
        assert!(matches!(err, Err(AppError::Unavailable(_))));
    }

    #[tokio::test]
    async fn warm_cache_replays_configured_tuples() {
        let provider = Arc::new(CountingProvider::new(vec![policy(
            Effect::Permit,
            0,
            &["doc1"],
        )]));
        let audit = AuditSink::spawn(Arc::new(NullAuditStore), 64);
        let mut config = test_config();
        config.warm_cache_tuples = serde_json::to_string(&vec![request("doc1", "read")]).unwrap();
        let engine = Arc::new(AuthzEngine::new(provider, audit, config));

        let warmed = engine.warm_cache().await.unwrap();
        assert_eq!(warmed, 1);

        let decision = engine.authorize(&request("doc1", "read"), "req-1").await.unwrap();
        assert!(decision.cache_hit);
    }
}
