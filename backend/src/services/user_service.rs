//! User management and credential verification.

use chrono::Utc;
use moka::future::Cache;
use serde_json::{json, Value};
use sqlx::types::Json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::AuthnConfig;
use crate::db::connection::DbPool;
use crate::error::AppError;
use crate::models::user::{AdminUpdateUser, CreateUser, UpdateProfile, User};
use crate::repositories::user as user_repo;
use crate::services::audit_sink::AuditSink;
use crate::types::UserId;
use crate::utils::password::{hash_password, verify_against_dummy, verify_password};

/// Why an authentication attempt was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    UserNotFound,
    AccountInactive,
    AccountLocked,
    InvalidPassword,
}

impl AuthFailure {
    pub fn reason(&self) -> &'static str {
        match self {
            AuthFailure::UserNotFound => "user_not_found",
            AuthFailure::AccountInactive => "account_inactive",
            AuthFailure::AccountLocked => "account_locked",
            AuthFailure::InvalidPassword => "invalid_password",
        }
    }
}

#[derive(Debug)]
pub enum AuthOutcome {
    Success(User),
    Failure(AuthFailure),
}

pub struct UserService {
    pool: DbPool,
    config: AuthnConfig,
    audit: AuditSink,
    /// Read-through cache keyed by both `id:<uuid>` and `username:<name>`.
    /// Advisory only: a miss always falls through to the store.
    cache: Cache<String, User>,
    logins_today: AtomicU64,
    failures_today: AtomicU64,
}

fn id_key(user_id: UserId) -> String {
    format!("id:{user_id}")
}

fn username_key(username: &str) -> String {
    format!("username:{username}")
}

impl UserService {
    pub fn new(pool: DbPool, config: AuthnConfig, audit: AuditSink) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.user_cache_capacity)
            .time_to_live(Duration::from_secs(config.user_cache_ttl_secs))
            .build();
        Self {
            pool,
            config,
            audit,
            cache,
            logins_today: AtomicU64::new(0),
            failures_today: AtomicU64::new(0),
        }
    }

    /// Verifies credentials and applies the lockout state machine.
    ///
    /// The unknown-username path burns a dummy hash verification so it takes
    /// comparable time to a wrong password and usernames cannot be enumerated.
    pub async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthOutcome, AppError> {
        let Some(user) = self.get_user_by_username(username).await? else {
            let candidate = password.to_string();
            tokio::task::spawn_blocking(move || verify_against_dummy(&candidate))
                .await
                .map_err(|e| AppError::InternalServerError(e.into()))?;
            self.failures_today.fetch_add(1, Ordering::Relaxed);
            self.audit_auth_event(
                None,
                "login_failed",
                false,
                json!({"reason": AuthFailure::UserNotFound.reason(), "username": username}),
            );
            return Ok(AuthOutcome::Failure(AuthFailure::UserNotFound));
        };

        if !user.is_active {
            self.audit_auth_event(
                Some(&user),
                "login_failed",
                false,
                json!({"reason": AuthFailure::AccountInactive.reason()}),
            );
            return Ok(AuthOutcome::Failure(AuthFailure::AccountInactive));
        }

        let now = Utc::now();
        if user.is_locked(now) {
            self.audit_auth_event(
                Some(&user),
                "login_failed",
                false,
                json!({
                    "reason": AuthFailure::AccountLocked.reason(),
                    "locked_until": user.locked_until,
                }),
            );
            return Ok(AuthOutcome::Failure(AuthFailure::AccountLocked));
        }

        let candidate = password.to_string();
        let stored_hash = user.password_hash.clone();
        let matches = tokio::task::spawn_blocking(move || verify_password(&candidate, &stored_hash))
            .await
            .map_err(|e| AppError::InternalServerError(e.into()))?
            .map_err(AppError::InternalServerError)?;

        if !matches {
            self.handle_failed_login(&user).await?;
            return Ok(AuthOutcome::Failure(AuthFailure::InvalidPassword));
        }

        user_repo::record_successful_login(&self.pool, user.id).await?;
        self.invalidate_user_cache(&user).await;
        self.logins_today.fetch_add(1, Ordering::Relaxed);
        self.audit_auth_event(Some(&user), "login_success", true, json!({}));

        let mut user = user;
        user.failed_login_attempts = 0;
        user.locked_until = None;
        user.last_login = Some(now);
        Ok(AuthOutcome::Success(user))
    }

    async fn handle_failed_login(&self, user: &User) -> Result<(), AppError> {
        let failed_attempts = user.failed_login_attempts + 1;
        let locked_until = if failed_attempts >= self.config.max_failed_attempts {
            let until = Utc::now() + self.config.lockout_duration();
            tracing::warn!(
                user_id = %user.id,
                attempts = failed_attempts,
                "User account locked after repeated failed logins"
            );
            Some(until)
        } else {
            None
        };

        user_repo::record_failed_login(&self.pool, user.id, failed_attempts, locked_until).await?;
        self.invalidate_user_cache(user).await;
        self.failures_today.fetch_add(1, Ordering::Relaxed);
        self.audit_auth_event(
            Some(user),
            "login_failed",
            false,
            json!({
                "reason": AuthFailure::InvalidPassword.reason(),
                "failed_attempts": failed_attempts,
                "locked": locked_until.is_some(),
            }),
        );
        Ok(())
    }

    pub async fn get_user_by_id(&self, user_id: UserId) -> Result<Option<User>, AppError> {
        if let Some(user) = self.cache.get(&id_key(user_id)).await {
            return Ok(Some(user));
        }
        let user = user_repo::find_user_by_id(&self.pool, user_id).await?;
        if let Some(user) = &user {
            self.cache_user(user).await;
        }
        Ok(user)
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        if let Some(user) = self.cache.get(&username_key(username)).await {
            return Ok(Some(user));
        }
        let user = user_repo::find_user_by_username(&self.pool, username).await?;
        if let Some(user) = &user {
            self.cache_user(user).await;
        }
        Ok(user)
    }

    pub async fn create_user(&self, payload: CreateUser) -> Result<User, AppError> {
        let password = payload.password.clone();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AppError::InternalServerError(e.into()))?
            .map_err(AppError::InternalServerError)?;

        let mut user = User::new(payload.username, payload.email, password_hash);
        user.first_name = payload.first_name;
        user.last_name = payload.last_name;
        user.display_name = payload.display_name;
        user.roles = payload.roles;
        user.primary_role = payload.primary_role;
        user.is_active = payload.is_active;
        user.email_verified = payload.email_verified;
        user.mfa_enabled = payload.mfa_enabled;
        if let Some(metadata) = payload.metadata {
            user.metadata = Json(metadata);
        }

        user_repo::insert_user(&self.pool, &user).await.map_err(|err| {
            if user_repo::is_unique_violation(&err) {
                AppError::BadRequest("Username already exists".to_string())
            } else {
                AppError::InternalServerError(err.into())
            }
        })?;

        self.audit_auth_event(
            Some(&user),
            "user_created",
            true,
            json!({"username": user.username}),
        );
        Ok(user)
    }

    pub async fn update_profile(
        &self,
        user_id: UserId,
        payload: UpdateProfile,
    ) -> Result<User, AppError> {
        let mut user = self
            .get_user_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        if let Some(first_name) = payload.first_name {
            user.first_name = Some(first_name);
        }
        if let Some(last_name) = payload.last_name {
            user.last_name = Some(last_name);
        }
        if let Some(display_name) = payload.display_name {
            user.display_name = Some(display_name);
        }
        if let Some(email) = payload.email {
            user.email = email;
        }
        if let Some(metadata) = payload.metadata {
            user.metadata = Json(metadata);
        }

        self.persist_update(user, &["profile"]).await
    }

    pub async fn admin_update_user(
        &self,
        user_id: UserId,
        payload: AdminUpdateUser,
    ) -> Result<User, AppError> {
        let mut user = self
            .get_user_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound("User not found".to_string()))?;

        let mut fields: Vec<&str> = Vec::new();
        if let Some(first_name) = payload.first_name {
            user.first_name = Some(first_name);
            fields.push("first_name");
        }
        if let Some(last_name) = payload.last_name {
            user.last_name = Some(last_name);
            fields.push("last_name");
        }
        if let Some(display_name) = payload.display_name {
            user.display_name = Some(display_name);
            fields.push("display_name");
        }
        if let Some(email) = payload.email {
            user.email = email;
            fields.push("email");
        }
        if let Some(roles) = payload.roles {
            user.roles = roles;
            fields.push("roles");
        }
        if let Some(primary_role) = payload.primary_role {
            user.primary_role = primary_role;
            fields.push("primary_role");
        }
        if let Some(is_active) = payload.is_active {
            user.is_active = is_active;
            fields.push("is_active");
        }
        if let Some(email_verified) = payload.email_verified {
            user.email_verified = email_verified;
            fields.push("email_verified");
        }
        if let Some(mfa_enabled) = payload.mfa_enabled {
            user.mfa_enabled = mfa_enabled;
            fields.push("mfa_enabled");
        }
        if let Some(metadata) = payload.metadata {
            user.metadata = Json(metadata);
            fields.push("metadata");
        }

        self.persist_update(user, &fields).await
    }

    async fn persist_update(&self, user: User, fields: &[&str]) -> Result<User, AppError> {
        let updated = user_repo::update_user(&self.pool, &user).await?;
        if !updated {
            return Err(AppError::NotFound("User not found".to_string()));
        }
        self.invalidate_user_cache(&user).await;
        self.audit_auth_event(
            Some(&user),
            "user_updated",
            true,
            json!({"fields": fields}),
        );
        Ok(user)
    }

    /// Rehashes with a fresh salt and stores the new hash. The caller is
    /// responsible for ending the user's sessions afterwards.
    pub async fn change_password(
        &self,
        user_id: UserId,
        new_password: &str,
    ) -> Result<(), AppError> {
        let password = new_password.to_string();
        let password_hash = tokio::task::spawn_blocking(move || hash_password(&password))
            .await
            .map_err(|e| AppError::InternalServerError(e.into()))?
            .map_err(AppError::InternalServerError)?;

        let updated = user_repo::update_password_hash(&self.pool, user_id, &password_hash).await?;
        if !updated {
            return Err(AppError::NotFound("User not found".to_string()));
        }

        if let Some(user) = user_repo::find_user_by_id(&self.pool, user_id).await? {
            self.invalidate_user_cache(&user).await;
            self.audit_auth_event(Some(&user), "password_changed", true, json!({}));
        }
        Ok(())
    }

    pub async fn delete_user(&self, user_id: UserId) -> Result<(), AppError> {
        let user = self.get_user_by_id(user_id).await?;
        let deleted = user_repo::delete_user(&self.pool, user_id).await?;
        if !deleted {
            return Err(AppError::NotFound("User not found".to_string()));
        }
        if let Some(user) = user {
            self.invalidate_user_cache(&user).await;
        }
        self.audit.write(crate::models::audit::AuditRecord::new(
            Some(user_id.to_string()),
            "user_deleted",
            true,
            None,
        ));
        Ok(())
    }

    pub async fn list_users(&self, limit: i64, offset: i64) -> Result<Vec<User>, AppError> {
        Ok(user_repo::list_users(&self.pool, limit.clamp(1, 500), offset.max(0)).await?)
    }

    /// Creates the default `admin` account when missing. Idempotent.
    pub async fn ensure_default_admin(&self) -> Result<(), AppError> {
        if self.get_user_by_username("admin").await?.is_some() {
            return Ok(());
        }

        let payload = CreateUser {
            username: "admin".to_string(),
            email: "admin@palisade.local".to_string(),
            password: self.config.default_admin_password.clone(),
            first_name: Some("System".to_string()),
            last_name: Some("Administrator".to_string()),
            display_name: Some("System Administrator".to_string()),
            roles: vec!["admin".to_string(), "user".to_string()],
            primary_role: "admin".to_string(),
            is_active: true,
            email_verified: true,
            mfa_enabled: false,
            metadata: None,
        };

        match self.create_user(payload).await {
            Ok(_) => {
                tracing::warn!(
                    "Default admin user created - change the password before production use"
                );
                self.audit.write(crate::models::audit::AuditRecord::new(
                    None,
                    "default_admin_created",
                    true,
                    Some(json!({"warning": "default credentials in use"})),
                ));
                Ok(())
            }
            // A concurrent replica may have won the race; that is fine.
            Err(AppError::BadRequest(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub async fn metrics(&self) -> Result<Value, AppError> {
        let counts = user_repo::count_users(&self.pool).await?;
        Ok(json!({
            "total_users": counts.total,
            "active_users": counts.active,
            "locked_users": counts.locked,
            "successful_logins_today": self.logins_today.load(Ordering::Relaxed),
            "failed_attempts_today": self.failures_today.load(Ordering::Relaxed),
        }))
    }

    async fn cache_user(&self, user: &User) {
        self.cache.insert(id_key(user.id), user.clone()).await;
        self.cache
            .insert(username_key(&user.username), user.clone())
            .await;
    }

    /// Drops both cache keys for a user after any mutation.
    pub async fn invalidate_user_cache(&self, user: &User) {
        self.cache.invalidate(&id_key(user.id)).await;
        self.cache.invalidate(&username_key(&user.username)).await;
    }

    fn audit_auth_event(&self, user: Option<&User>, event_type: &str, success: bool, metadata: Value) {
        self.audit.write(crate::models::audit::AuditRecord::new(
            user.map(|u| u.id.to_string()),
            event_type,
            success,
            Some(metadata),
        ));
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

pub type SharedUserService = Arc<UserService>;
