//! Gateway-side clients for the authn/authz control calls.

use serde_json::{json, Map, Value};

use crate::config::GatewayConfig;
use crate::models::decision::{Decision, DecisionResponse};
use crate::models::token::ValidateResponse;

use super::routes::Upstream;

/// Control-plane errors are kept separate from proxied responses so the
/// pipeline can apply its fail-open/fail-closed policy per step.
#[derive(Debug)]
pub enum UpstreamError {
    /// Service unreachable or errored; surfaces as 503 unless the narrow
    /// fail-open rule applies.
    Unavailable(String),
}

pub struct UpstreamClients {
    client: reqwest::Client,
    authn_base: String,
    authz_base: String,
}

impl UpstreamClients {
    pub fn new(client: reqwest::Client, config: &GatewayConfig) -> Self {
        Self {
            client,
            authn_base: config.authn_base_url.trim_end_matches('/').to_string(),
            authz_base: config.authz_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self, upstream: Upstream) -> &str {
        match upstream {
            Upstream::Authn => &self.authn_base,
            Upstream::Authz => &self.authz_base,
        }
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    /// Resolves caller identity via the authn service. A 401 from authn is a
    /// definitive "invalid"; transport failures are unavailability.
    pub async fn validate(&self, bearer: &str) -> Result<ValidateResponse, UpstreamError> {
        let url = format!("{}/auth/validate", self.authn_base);
        let response = self
            .client
            .get(&url)
            .header("authorization", format!("Bearer {bearer}"))
            .send()
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Ok(ValidateResponse::invalid());
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Unavailable(format!(
                "authn validate returned {}",
                response.status()
            )));
        }
        response
            .json::<ValidateResponse>()
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))
    }

    /// Asks the authorization service whether the caller may perform an admin
    /// operation. Fail-closed: transport errors bubble as unavailability.
    pub async fn authorize_admin(
        &self,
        caller: &ValidateResponse,
        resource: &str,
        action: &str,
        path: &str,
    ) -> Result<Decision, UpstreamError> {
        let mut context = Map::new();
        context.insert("path".to_string(), Value::String(path.to_string()));

        let body = json!({
            "subject": {
                "id": caller.subject.clone().unwrap_or_default(),
                "roles": caller.roles,
                "attributes": {},
            },
            "resource": resource,
            "action": action,
            "context": context,
        });

        let url = format!("{}/authorize", self.authz_base);
        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(UpstreamError::Unavailable(format!(
                "authz authorize returned {}",
                response.status()
            )));
        }
        response
            .json::<DecisionResponse>()
            .await
            .map(|body| body.decision)
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))
    }
}
