//! Root contexts owning each service's subsystems.
//!
//! Constructed once at startup and passed into handlers explicitly; the only
//! process-wide mutable state are the caches, which guard themselves.

use std::sync::Arc;
use std::time::Instant;

use crate::config::{AuthnConfig, AuthzConfig, GatewayConfig};
use crate::db::connection::DbPool;
use crate::gateway::client::UpstreamClients;
use crate::gateway::health::HealthRegistry;
use crate::gateway::metrics::GatewayMetrics;
use crate::middleware::rate_limit::SlidingWindowLimiter;
use crate::services::audit_sink::AuditSink;
use crate::services::authz_engine::AuthzEngine;
use crate::services::policy_service::PolicyService;
use crate::services::token_service::TokenService;
use crate::services::user_service::UserService;

#[derive(Clone)]
pub struct AuthnState {
    pub pool: DbPool,
    pub config: AuthnConfig,
    pub users: Arc<UserService>,
    pub tokens: Arc<TokenService>,
    pub audit: AuditSink,
}

impl AuthnState {
    pub fn new(
        pool: DbPool,
        config: AuthnConfig,
        users: Arc<UserService>,
        tokens: Arc<TokenService>,
        audit: AuditSink,
    ) -> Self {
        Self {
            pool,
            config,
            users,
            tokens,
            audit,
        }
    }
}

#[derive(Clone)]
pub struct AuthzState {
    pub pool: DbPool,
    pub config: AuthzConfig,
    pub engine: Arc<AuthzEngine>,
    pub policies: Arc<PolicyService>,
    pub audit: AuditSink,
    pub started_at: Instant,
}

impl AuthzState {
    pub fn new(
        pool: DbPool,
        config: AuthzConfig,
        engine: Arc<AuthzEngine>,
        policies: Arc<PolicyService>,
        audit: AuditSink,
    ) -> Self {
        Self {
            pool,
            config,
            engine,
            policies,
            audit,
            started_at: Instant::now(),
        }
    }
}

#[derive(Clone)]
pub struct GatewayState {
    pub config: GatewayConfig,
    pub clients: Arc<UpstreamClients>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub health: Arc<HealthRegistry>,
    pub metrics: Arc<GatewayMetrics>,
}

impl GatewayState {
    pub fn new(
        config: GatewayConfig,
        clients: Arc<UpstreamClients>,
        limiter: Arc<SlidingWindowLimiter>,
        health: Arc<HealthRegistry>,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            config,
            clients,
            limiter,
            health,
            metrics,
        }
    }
}
