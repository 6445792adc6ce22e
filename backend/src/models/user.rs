//! Models that represent users, authentication payloads, and profile DTOs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{types::Json, FromRow};
use utoipa::ToSchema;
use validator::Validate;

use crate::types::UserId;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
/// Database representation of a user account.
pub struct User {
    /// Unique identifier for the user.
    pub id: UserId,
    /// Immutable username used for login.
    pub username: String,
    pub email: String,
    /// Argon2 hash of the user's password (PHC string format).
    pub password_hash: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    /// Role names granted to the user.
    pub roles: Vec<String>,
    /// Role reported as the user's main role in profile responses.
    pub primary_role: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub mfa_enabled: bool,
    /// Consecutive failed logins since the last success.
    pub failed_login_attempts: i32,
    /// While this is in the future, authentication is refused.
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login: Option<DateTime<Utc>>,
    /// Open attribute bag consumed by policy evaluation.
    pub metadata: Json<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Constructs a new user with freshly generated identifiers.
    pub fn new(username: String, email: String, password_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            username,
            email,
            password_hash,
            first_name: None,
            last_name: None,
            display_name: None,
            roles: vec!["user".to_string()],
            primary_role: "user".to_string(),
            is_active: true,
            email_verified: false,
            mfa_enabled: false,
            failed_login_attempts: 0,
            locked_until: None,
            last_login: None,
            metadata: Json(Value::Object(Default::default())),
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` when the user holds the `admin` role.
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "admin")
    }

    /// Returns `true` while a lockout window is in effect.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.map(|until| until > now).unwrap_or(false)
    }

    /// Display name with username fallback.
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
/// Payload for creating a new user account.
pub struct CreateUser {
    #[validate(length(min = 3, max = 64))]
    pub username: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_roles")]
    pub roles: Vec<String>,
    #[serde(default = "default_primary_role")]
    pub primary_role: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default)]
    pub mfa_enabled: bool,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: Option<Value>,
}

fn default_roles() -> Vec<String> {
    vec!["user".to_string()]
}

fn default_primary_role() -> String {
    "user".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Default, Serialize, Deserialize, Validate, ToSchema)]
/// Payload for updating the caller's own profile.
pub struct UpdateProfile {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[schema(value_type = Object)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Default, Serialize, Deserialize, ToSchema)]
/// Admin-only payload for updating any portion of a user record.
pub struct AdminUpdateUser {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub roles: Option<Vec<String>>,
    pub primary_role: Option<String>,
    pub is_active: Option<bool>,
    pub email_verified: Option<bool>,
    pub mfa_enabled: Option<bool>,
    #[schema(value_type = Object)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
/// Credentials submitted by a user attempting to authenticate.
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
/// Payload submitted when a user requests to change their password.
pub struct ChangePasswordRequest {
    /// Existing password that will be verified before applying the change.
    pub current_password: String,
    /// Replacement password that will be stored if verification succeeds.
    #[validate(length(min = 8, max = 128))]
    pub new_password: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
/// Authentication tokens returned after a successful login or refresh.
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    pub user: UserResponse,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
/// Public-facing representation of a user returned by the API.
pub struct UserResponse {
    pub id: String,
    pub username: String,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub display_name: String,
    pub roles: Vec<String>,
    pub primary_role: String,
    pub is_active: bool,
    pub email_verified: bool,
    pub mfa_enabled: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[schema(value_type = Object)]
    pub metadata: Value,
}

impl From<User> for UserResponse {
    /// Converts the persistent user model into the API response DTO.
    fn from(user: User) -> Self {
        let display_name = user.display_name().to_string();
        UserResponse {
            id: user.id.to_string(),
            username: user.username,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            display_name,
            roles: user.roles,
            primary_role: user.primary_role,
            is_active: user.is_active,
            email_verified: user.email_verified,
            mfa_enabled: user.mfa_enabled,
            last_login: user.last_login,
            created_at: user.created_at,
            metadata: user.metadata.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn new_user_defaults_to_active_user_role() {
        let user = User::new("alice".into(), "alice@example.com".into(), "hash".into());
        assert_eq!(user.roles, vec!["user".to_string()]);
        assert!(user.is_active);
        assert!(!user.is_admin());
        assert_eq!(user.failed_login_attempts, 0);
    }

    #[test]
    fn lock_state_follows_locked_until() {
        let mut user = User::new("alice".into(), "alice@example.com".into(), "hash".into());
        let now = Utc::now();
        assert!(!user.is_locked(now));

        user.locked_until = Some(now + Duration::minutes(5));
        assert!(user.is_locked(now));

        user.locked_until = Some(now - Duration::minutes(5));
        assert!(!user.is_locked(now));
    }

    #[test]
    fn display_name_falls_back_to_username() {
        let mut user = User::new("alice".into(), "alice@example.com".into(), "hash".into());
        assert_eq!(user.display_name(), "alice");
        user.display_name = Some("Alice Example".into());
        assert_eq!(user.display_name(), "Alice Example");
    }

    #[test]
    fn user_response_never_exposes_password_hash() {
        let user = User::new("alice".into(), "alice@example.com".into(), "hash".into());
        let response: UserResponse = user.into();
        let value = serde_json::to_value(&response).unwrap();
        assert!(value.get("password_hash").is_none());
        assert_eq!(value["username"], "alice");
    }

    #[test]
    fn create_user_validates_short_passwords() {
        let payload = CreateUser {
            username: "bob".into(),
            email: "bob@example.com".into(),
            password: "short".into(),
            first_name: None,
            last_name: None,
            display_name: None,
            roles: default_roles(),
            primary_role: default_primary_role(),
            is_active: true,
            email_verified: false,
            mfa_enabled: false,
            metadata: None,
        };
        assert!(payload.validate().is_err());
    }
}
