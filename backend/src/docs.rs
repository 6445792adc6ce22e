#![allow(dead_code)] // OpenAPI doc stubs are only referenced by utoipa macros.

use crate::models::{
    decision::{AuthorizeRequest, BulkAuthorizeRequest, BulkEntry, BulkSummary, SubjectDescriptor},
    policy::{Condition, CreatePolicy, Effect, PolicyResponse, PolicyTarget, TargetPredicate,
        UpdatePolicy},
    session::SessionResponse,
    token::{TokenKind, ValidateResponse},
    user::{
        AdminUpdateUser, ChangePasswordRequest, CreateUser, LoginRequest, LoginResponse,
        UpdateProfile, UserResponse,
    },
};
use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        login_doc,
        refresh_doc,
        logout_doc,
        validate_doc,
        me_doc,
        change_password_doc,
        sessions_doc,
    ),
    components(schemas(
        LoginRequest,
        LoginResponse,
        UserResponse,
        CreateUser,
        UpdateProfile,
        AdminUpdateUser,
        ChangePasswordRequest,
        SessionResponse,
        ValidateResponse,
        TokenKind,
    )),
    modifiers(&BearerAuth),
    tags((name = "authn", description = "Authentication service"))
)]
pub struct AuthnApiDoc;

#[derive(OpenApi)]
#[openapi(
    paths(authorize_doc, authorize_bulk_doc, policies_doc),
    components(schemas(
        AuthorizeRequest,
        BulkAuthorizeRequest,
        BulkEntry,
        BulkSummary,
        SubjectDescriptor,
        CreatePolicy,
        UpdatePolicy,
        PolicyResponse,
        PolicyTarget,
        TargetPredicate,
        Condition,
        Effect,
    )),
    tags((name = "authz", description = "Authorization service"))
)]
pub struct AuthzApiDoc;

struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[utoipa::path(post, path = "/auth/login", tag = "authn",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Token pair issued", body = LoginResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 423, description = "Account locked"),
    )
)]
async fn login_doc() {}

#[utoipa::path(post, path = "/auth/refresh", tag = "authn",
    responses(
        (status = 200, description = "New token pair", body = LoginResponse),
        (status = 401, description = "Invalid or expired refresh token"),
    )
)]
async fn refresh_doc() {}

#[utoipa::path(post, path = "/auth/logout", tag = "authn", security(("bearer" = [])),
    responses((status = 200, description = "Session ended")))]
async fn logout_doc() {}

#[utoipa::path(get, path = "/auth/validate", tag = "authn", security(("bearer" = [])),
    responses(
        (status = 200, description = "Token introspection", body = ValidateResponse),
        (status = 401, description = "Invalid, expired, or revoked token"),
    )
)]
async fn validate_doc() {}

#[utoipa::path(get, path = "/users/me", tag = "authn", security(("bearer" = [])),
    responses((status = 200, description = "Caller profile", body = UserResponse)))]
async fn me_doc() {}

#[utoipa::path(post, path = "/users/change-password", tag = "authn",
    security(("bearer" = [])),
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed; all sessions ended"),
        (status = 401, description = "Current password incorrect"),
    )
)]
async fn change_password_doc() {}

#[utoipa::path(get, path = "/sessions/me", tag = "authn", security(("bearer" = [])),
    responses((status = 200, description = "Active sessions", body = [SessionResponse])))]
async fn sessions_doc() {}

#[utoipa::path(post, path = "/authorize", tag = "authz",
    request_body = AuthorizeRequest,
    responses((status = 200, description = "Decision with effect, reason, obligations")))]
async fn authorize_doc() {}

#[utoipa::path(post, path = "/authorize/bulk", tag = "authz",
    request_body = BulkAuthorizeRequest,
    responses((status = 200, description = "Decisions in input order plus summary")))]
async fn authorize_bulk_doc() {}

#[utoipa::path(get, path = "/policies", tag = "authz",
    responses((status = 200, description = "Latest version of each policy", body = [PolicyResponse])))]
async fn policies_doc() {}
