//! Gateway rate limiting.
//!
//! Two layers: a per-caller sliding-window limiter keyed by caller identity
//! (or source address) plus route bucket, consulted in the dispatch pipeline;
//! and a governor-based peer-IP limiter mounted in front of the credential
//! endpoints as flood protection for unauthenticated traffic.

use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, HeaderValue, Response, StatusCode};
use governor::middleware::StateInformationMiddleware;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::PeerIpKeyExtractor, GovernorError,
    GovernorLayer,
};

use crate::config::GatewayConfig;
use crate::error::{ErrorContext, ErrorEnvelope};

const STORE_CLEANUP_THRESHOLD: usize = 10_000;

/// Per-caller sliding-window limiter. Timestamps use the monotonic clock;
/// state is per gateway instance with no cross-instance coordination.
pub struct SlidingWindowLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<(String, String), VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.rate_limit_max_requests,
            Duration::from_secs(config.rate_limit_window_secs),
        )
    }

    /// Admits or rejects one request. On rejection returns the retry-after
    /// hint in seconds.
    pub fn check(&self, caller: &str, bucket: &str) -> Result<(), u64> {
        self.check_at(caller, bucket, Instant::now())
    }

    fn check_at(&self, caller: &str, bucket: &str, now: Instant) -> Result<(), u64> {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        if windows.len() > STORE_CLEANUP_THRESHOLD {
            let window = self.window;
            windows.retain(|_, hits| {
                hits.front()
                    .map(|oldest| now.duration_since(*oldest) < window)
                    .unwrap_or(false)
            });
        }

        let key = (caller.to_string(), bucket.to_string());
        let hits = windows.entry(key).or_default();
        while let Some(oldest) = hits.front() {
            if now.duration_since(*oldest) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }

        if hits.len() >= self.max_requests as usize {
            let oldest = hits.front().copied().unwrap_or(now);
            let retry_after = self
                .window
                .saturating_sub(now.duration_since(oldest))
                .as_secs()
                .max(1);
            return Err(retry_after);
        }

        hits.push_back(now);
        Ok(())
    }

    pub fn tracked_windows(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Peer-IP limiter for the gateway's credential routes.
pub fn create_login_rate_limiter(
    config: &GatewayConfig,
) -> GovernorLayer<PeerIpKeyExtractor, StateInformationMiddleware, Body> {
    let burst_size = config.login_ip_max_requests.max(1);
    let window_seconds = config.login_ip_window_secs.max(1);
    let governor_conf = std::sync::Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(window_seconds))
            .burst_size(burst_size)
            .key_extractor(PeerIpKeyExtractor)
            .use_headers()
            .finish()
            .expect("rate limiter config should be valid"),
    );

    GovernorLayer::new(governor_conf).error_handler(rate_limit_error_handler)
}

fn rate_limit_error_handler(error: GovernorError) -> Response<Body> {
    match error {
        GovernorError::TooManyRequests { wait_time, headers } => {
            tracing::warn!(wait_time, "Rate limit exceeded");
            let mut response = envelope_response(
                StatusCode::TOO_MANY_REQUESTS,
                "Too many requests. Please try again later.",
                Some(wait_time),
            );
            if let Some(headers) = headers {
                response.headers_mut().extend(headers);
            }
            response
        }
        GovernorError::UnableToExtractKey => envelope_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to determine request identity.",
            None,
        ),
        GovernorError::Other { code, msg, headers } => {
            let mut response = envelope_response(
                code,
                &msg.unwrap_or_else(|| "Rate limit error".to_string()),
                None,
            );
            if let Some(headers) = headers {
                response.headers_mut().extend(headers);
            }
            response
        }
    }
}

fn envelope_response(status: StatusCode, message: &str, retry_after: Option<u64>) -> Response<Body> {
    let envelope = ErrorEnvelope::new(status, message, "");
    let body = serde_json::to_string(&envelope).unwrap_or_default();

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Some(retry_after) = retry_after {
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            response.headers_mut().insert("retry-after", value);
        }
    }
    // The request-context middleware fills in the path.
    response.extensions_mut().insert(ErrorContext {
        code: status,
        message: message.to_string(),
    });
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_at("alice", "auth", now).is_ok());
        }
        let retry = limiter.check_at("alice", "auth", now).unwrap_err();
        assert!(retry >= 1);
    }

    #[test]
    fn window_slides_as_old_hits_expire() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();
        assert!(limiter.check_at("alice", "auth", start).is_ok());
        assert!(limiter
            .check_at("alice", "auth", start + Duration::from_secs(5))
            .is_ok());
        assert!(limiter
            .check_at("alice", "auth", start + Duration::from_secs(6))
            .is_err());
        // The first hit has aged out; one slot is free again.
        assert!(limiter
            .check_at("alice", "auth", start + Duration::from_secs(11))
            .is_ok());
    }

    #[test]
    fn callers_and_buckets_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.check_at("alice", "auth", now).is_ok());
        assert!(limiter.check_at("alice", "auth", now).is_err());
        assert!(limiter.check_at("alice", "authz", now).is_ok());
        assert!(limiter.check_at("bob", "auth", now).is_ok());
    }

    #[test]
    fn retry_after_counts_down_toward_window_edge() {
        let limiter = SlidingWindowLimiter::new(1, Duration::from_secs(30));
        let start = Instant::now();
        assert!(limiter.check_at("alice", "auth", start).is_ok());
        let retry = limiter
            .check_at("alice", "auth", start + Duration::from_secs(20))
            .unwrap_err();
        assert!(retry <= 10);
    }

    #[test]
    fn governor_error_handler_sets_envelope_and_retry_after() {
        let error = GovernorError::TooManyRequests {
            wait_time: 5,
            headers: None,
        };
        let response = rate_limit_error_handler(error);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().get(CONTENT_TYPE).is_some());
        assert!(response.headers().get("retry-after").is_some());
        assert!(response.extensions().get::<ErrorContext>().is_some());
    }
}
