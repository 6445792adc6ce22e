//! Background health probing of gateway upstreams.
//!
//! Probes inform the operator through `/gateway/health`; they do not gate
//! dispatch.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use super::routes::Upstream;

#[derive(Debug, Clone, Serialize)]
pub struct UpstreamStatus {
    pub healthy: bool,
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Default for UpstreamStatus {
    fn default() -> Self {
        Self {
            healthy: false,
            last_checked: None,
            detail: Some("not yet probed".to_string()),
        }
    }
}

#[derive(Default)]
pub struct HealthRegistry {
    statuses: RwLock<HashMap<&'static str, UpstreamStatus>>,
}

impl HealthRegistry {
    pub fn record(&self, upstream: Upstream, status: UpstreamStatus) {
        let mut statuses = self.statuses.write().unwrap_or_else(|e| e.into_inner());
        statuses.insert(upstream.name(), status);
    }

    pub fn snapshot(&self) -> HashMap<&'static str, UpstreamStatus> {
        self.statuses
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn all_healthy(&self) -> bool {
        let statuses = self.statuses.read().unwrap_or_else(|e| e.into_inner());
        !statuses.is_empty() && statuses.values().all(|status| status.healthy)
    }
}

/// Polls one upstream's `/health` on a fixed interval.
pub fn spawn_probe(
    client: reqwest::Client,
    registry: std::sync::Arc<HealthRegistry>,
    upstream: Upstream,
    base_url: String,
    interval: Duration,
) {
    tokio::spawn(async move {
        let url = format!("{}/health", base_url.trim_end_matches('/'));
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let status = match client
                .get(&url)
                .timeout(Duration::from_secs(2))
                .send()
                .await
            {
                Ok(response) if response.status().is_success() => UpstreamStatus {
                    healthy: true,
                    last_checked: Some(Utc::now()),
                    detail: None,
                },
                Ok(response) => UpstreamStatus {
                    healthy: false,
                    last_checked: Some(Utc::now()),
                    detail: Some(format!("health returned {}", response.status())),
                },
                Err(err) => UpstreamStatus {
                    healthy: false,
                    last_checked: Some(Utc::now()),
                    detail: Some(err.to_string()),
                },
            };
            if !status.healthy {
                tracing::warn!(
                    upstream = upstream.name(),
                    detail = status.detail.as_deref().unwrap_or(""),
                    "Upstream probe unhealthy"
                );
            }
            registry.record(upstream, status);
        }
    });
}
