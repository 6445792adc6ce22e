//! Gateway request counters, surfaced at `/gateway/metrics`.

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct GatewayMetrics {
    pub requests_total: AtomicU64,
    pub rate_limited: AtomicU64,
    pub auth_failures: AtomicU64,
    pub authz_denials: AtomicU64,
    pub upstream_errors: AtomicU64,
    pub fallback_permits: AtomicU64,
    pub forwarded_authn: AtomicU64,
    pub forwarded_authz: AtomicU64,
}

impl GatewayMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "requests_total": self.requests_total.load(Ordering::Relaxed),
            "rate_limited": self.rate_limited.load(Ordering::Relaxed),
            "auth_failures": self.auth_failures.load(Ordering::Relaxed),
            "authz_denials": self.authz_denials.load(Ordering::Relaxed),
            "upstream_errors": self.upstream_errors.load(Ordering::Relaxed),
            "fallback_permits": self.fallback_permits.load(Ordering::Relaxed),
            "forwarded": {
                "authn": self.forwarded_authn.load(Ordering::Relaxed),
                "authz": self.forwarded_authz.load(Ordering::Relaxed),
            },
        })
    }
}
