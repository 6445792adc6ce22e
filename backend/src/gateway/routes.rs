//! Static route table mapping public gateway paths onto upstream services.

/// Upstream service selected by the route table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Upstream {
    Authn,
    Authz,
}

impl Upstream {
    pub fn name(&self) -> &'static str {
        match self {
            Upstream::Authn => "authn",
            Upstream::Authz => "authz",
        }
    }
}

/// What the pipeline must do for one matched route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub upstream: Upstream,
    /// Path forwarded to the upstream (its own prefix conventions applied).
    pub forward_path: String,
    pub requires_auth: bool,
    /// When set, the route is admin-gated: the gateway asks the authorization
    /// service for `(resource, <http verb>)` before forwarding.
    pub admin_resource: Option<&'static str>,
    /// True only for the data-plane authorize endpoint, which is the single
    /// route eligible for the configured development fail-open.
    pub is_authorize_endpoint: bool,
}

/// First path segment under `/api/v1/`; used as the rate-limit bucket.
pub fn route_bucket(path: &str) -> &str {
    path.strip_prefix("/api/v1/")
        .and_then(|rest| rest.split('/').next())
        .filter(|segment| !segment.is_empty())
        .unwrap_or("root")
}

/// Resolves a public gateway path. `None` means 404.
///
/// Prefix rules: `auth/` and `users/` forward to the authentication service
/// unchanged; `authz/` forwards to the authorization service with the
/// `authz/` prefix stripped; `policies/` forwards to the authorization
/// service unchanged.
pub fn resolve(path: &str) -> Option<RouteDecision> {
    let rest = path.strip_prefix("/api/v1/")?.trim_end_matches('/');
    if rest.is_empty() {
        return None;
    }

    let (head, tail) = match rest.split_once('/') {
        Some((head, tail)) => (head, tail),
        None => (rest, ""),
    };

    match head {
        "auth" => {
            // Credential endpoints are public; everything else under auth/
            // needs a validated caller.
            let requires_auth = !matches!(tail, "login" | "refresh" | "validate");
            Some(RouteDecision {
                upstream: Upstream::Authn,
                forward_path: format!("/{rest}"),
                requires_auth,
                admin_resource: None,
                is_authorize_endpoint: false,
            })
        }
        "users" => Some(RouteDecision {
            upstream: Upstream::Authn,
            forward_path: format!("/{rest}"),
            requires_auth: true,
            admin_resource: None,
            is_authorize_endpoint: false,
        }),
        "policies" => Some(RouteDecision {
            upstream: Upstream::Authz,
            forward_path: format!("/{rest}"),
            requires_auth: true,
            admin_resource: Some("policies"),
            is_authorize_endpoint: false,
        }),
        "authz" if !tail.is_empty() => {
            let forward_path = format!("/{tail}");
            let (requires_auth, admin_resource) = classify_authz_path(tail);
            Some(RouteDecision {
                upstream: Upstream::Authz,
                forward_path,
                requires_auth,
                admin_resource,
                is_authorize_endpoint: tail == "authorize",
            })
        }
        _ => None,
    }
}

fn classify_authz_path(tail: &str) -> (bool, Option<&'static str>) {
    let first = tail.split('/').next().unwrap_or("");
    match first {
        // Data-plane authorize calls: any authenticated caller.
        "authorize" => (true, None),
        // Policy CRUD and audit reads are admin operations.
        "policies" => (true, Some("policies")),
        "audit" => (true, Some("audit")),
        "admin" => {
            if tail.starts_with("admin/security-alert") {
                (true, Some("audit"))
            } else {
                (true, Some("policies"))
            }
        }
        // Status/metrics/health pass through for operators.
        _ => (false, None),
    }
}
