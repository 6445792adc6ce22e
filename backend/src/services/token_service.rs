//! Token issuance, validation, revocation, and session lifecycle.
//!
//! Access and refresh tokens are signed JWTs whose `jti` is persisted so
//! revocation survives restarts. A session row joins one token pair; ending a
//! session revokes both tokens and deletes the row in a single transaction,
//! so a `validate` racing a `logout` sees exactly one of valid or revoked.

use chrono::Utc;
use moka::future::Cache;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::AuthnConfig;
use crate::db::connection::DbPool;
use crate::error::AppError;
use crate::models::session::Session;
use crate::models::token::{TokenKind, TokenRecord, ValidateResponse};
use crate::models::user::User;
use crate::repositories::{session as session_repo, token as token_repo};
use crate::services::audit_sink::AuditSink;
use crate::types::{SessionId, UserId};
use crate::utils::jwt::{create_token, verify_token, Claims};

/// A freshly minted token pair and its owning session.
#[derive(Debug)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: u64,
    pub session: Session,
}

pub struct TokenService {
    pool: DbPool,
    config: AuthnConfig,
    audit: AuditSink,
    /// Negative cache of recently revoked jtis; spares the store a read on
    /// repeated presentations of a dead token.
    revoked: Cache<String, ()>,
}

impl TokenService {
    pub fn new(pool: DbPool, config: AuthnConfig, audit: AuditSink) -> Self {
        let revoked = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(Duration::from_secs(config.revocation_cache_ttl_secs.max(1)))
            .build();
        Self {
            pool,
            config,
            audit,
            revoked,
        }
    }

    /// Issues an access/refresh pair and persists the session joining them.
    pub async fn issue_tokens(&self, user: &User) -> Result<IssuedTokens, AppError> {
        let (access_token, access_claims) = self.mint(user, TokenKind::Access)?;
        let (refresh_token, refresh_claims) = self.mint(user, TokenKind::Refresh)?;

        let session = Session {
            id: SessionId::new(),
            user_id: user.id,
            access_jti: access_claims.jti.clone(),
            refresh_jti: refresh_claims.jti.clone(),
            created_at: Utc::now(),
            last_seen_at: Some(Utc::now()),
            expires_at: chrono::DateTime::from_timestamp(refresh_claims.exp, 0)
                .unwrap_or_else(|| Utc::now() + self.config.refresh_token_ttl()),
        };

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        token_repo::insert_token(&mut *tx, &record_for(user.id, &access_claims)).await?;
        token_repo::insert_token(&mut *tx, &record_for(user.id, &refresh_claims)).await?;
        session_repo::insert_session(&mut *tx, &session).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            expires_in: self.config.access_token_ttl_secs,
            session,
        })
    }

    /// Signature, expiry, and revocation check for an access token. Cheap
    /// enough to run on every gated request.
    pub async fn validate(&self, token: &str) -> Result<ValidateResponse, AppError> {
        let Ok(claims) = verify_token(token, &self.config.jwt_secret, TokenKind::Access) else {
            return Ok(ValidateResponse::invalid());
        };

        if !self.is_live(&claims.jti).await? {
            return Ok(ValidateResponse::invalid());
        }

        // Best effort; a failed touch must not fail validation.
        let _ = session_repo::touch_session_by_access_jti(&self.pool, &claims.jti).await;

        Ok(ValidateResponse {
            valid: true,
            subject: Some(claims.sub),
            username: Some(claims.username),
            roles: claims.roles,
            scopes: claims.scopes,
            exp: Some(claims.exp),
        })
    }

    /// Verifies an access token and returns its claims, enforcing revocation.
    /// Used by the request-auth middleware.
    pub async fn authenticate_claims(&self, token: &str) -> Result<Claims, AppError> {
        let claims = verify_token(token, &self.config.jwt_secret, TokenKind::Access)
            .map_err(|_| AppError::Unauthorized("Invalid or expired token".to_string()))?;
        if !self.is_live(&claims.jti).await? {
            return Err(AppError::Unauthorized("Token revoked".to_string()));
        }
        Ok(claims)
    }

    async fn is_live(&self, jti: &str) -> Result<bool, AppError> {
        if self.revoked.get(jti).await.is_some() {
            return Ok(false);
        }
        match token_repo::find_token(&self.pool, jti).await? {
            // Unknown jtis never validate; every issued token is persisted.
            None => Ok(false),
            Some(TokenRecord { revoked: true, .. }) => {
                self.revoked.insert(jti.to_string(), ()).await;
                Ok(false)
            }
            Some(record) => Ok(record.expires_at > Utc::now()),
        }
    }

    /// Checks a presented refresh token (signature, expiry, revocation) and
    /// returns its claims without issuing anything yet.
    pub async fn check_refresh(&self, token: &str) -> Result<Claims, AppError> {
        let claims = verify_token(token, &self.config.jwt_secret, TokenKind::Refresh)
            .map_err(|_| AppError::Unauthorized("Invalid or expired refresh token".to_string()))?;

        let record = token_repo::find_token(&self.pool, &claims.jti)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid or expired refresh token".to_string()))?;
        if record.revoked || record.expires_at <= Utc::now() {
            return Err(AppError::Unauthorized(
                "Invalid or expired refresh token".to_string(),
            ));
        }
        Ok(claims)
    }

    /// Mints a new pair for a valid refresh. With rotation enabled the old
    /// refresh token is revoked in the same transaction, so it validates once
    /// and only once.
    pub async fn refresh(&self, user: &User, old_refresh: &Claims) -> Result<IssuedTokens, AppError> {
        let (access_token, access_claims) = self.mint(user, TokenKind::Access)?;

        if self.config.refresh_rotation {
            let (refresh_token, refresh_claims) = self.mint(user, TokenKind::Refresh)?;
            let expires_at = chrono::DateTime::from_timestamp(refresh_claims.exp, 0)
                .unwrap_or_else(|| Utc::now() + self.config.refresh_token_ttl());

            let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
            token_repo::insert_token(&mut *tx, &record_for(user.id, &access_claims)).await?;
            token_repo::insert_token(&mut *tx, &record_for(user.id, &refresh_claims)).await?;
            token_repo::revoke_token(&mut *tx, &old_refresh.jti).await?;
            let rebound = session_repo::update_session_tokens(
                &mut *tx,
                &old_refresh.jti,
                &access_claims.jti,
                &refresh_claims.jti,
                expires_at,
            )
            .await?;
            if !rebound {
                // Session is gone (logout raced the refresh); abort.
                tx.rollback().await.map_err(anyhow::Error::from)?;
                return Err(AppError::Unauthorized("Session no longer active".to_string()));
            }
            tx.commit().await.map_err(anyhow::Error::from)?;
            self.revoked.insert(old_refresh.jti.clone(), ()).await;

            let session = session_repo::find_session_by_refresh_jti(&self.pool, &refresh_claims.jti)
                .await?
                .ok_or_else(|| {
                    AppError::InternalServerError(anyhow::anyhow!("session vanished after rotate"))
                })?;

            self.audit.write(crate::models::audit::AuditRecord::new(
                Some(user.id.to_string()),
                "token_refreshed",
                true,
                Some(json!({"rotated": true})),
            ));

            return Ok(IssuedTokens {
                access_token,
                refresh_token,
                expires_in: self.config.access_token_ttl_secs,
                session,
            });
        }

        // Rotation disabled: keep the presented refresh token.
        let expires_at = chrono::DateTime::from_timestamp(old_refresh.exp, 0)
            .unwrap_or_else(|| Utc::now() + self.config.refresh_token_ttl());
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        token_repo::insert_token(&mut *tx, &record_for(user.id, &access_claims)).await?;
        let rebound = session_repo::update_session_tokens(
            &mut *tx,
            &old_refresh.jti,
            &access_claims.jti,
            &old_refresh.jti,
            expires_at,
        )
        .await?;
        if !rebound {
            tx.rollback().await.map_err(anyhow::Error::from)?;
            return Err(AppError::Unauthorized("Session no longer active".to_string()));
        }
        tx.commit().await.map_err(anyhow::Error::from)?;

        let session = session_repo::find_session_by_refresh_jti(&self.pool, &old_refresh.jti)
            .await?
            .ok_or_else(|| {
                AppError::InternalServerError(anyhow::anyhow!("session vanished after refresh"))
            })?;

        self.audit.write(crate::models::audit::AuditRecord::new(
            Some(user.id.to_string()),
            "token_refreshed",
            true,
            Some(json!({"rotated": false})),
        ));

        Ok(IssuedTokens {
            access_token,
            refresh_token: String::new(),
            expires_in: self.config.access_token_ttl_secs,
            session,
        })
    }

    /// Durably marks one token revoked.
    pub async fn revoke(&self, jti: &str) -> Result<bool, AppError> {
        let revoked = token_repo::revoke_token(&self.pool, jti).await?;
        self.revoked.insert(jti.to_string(), ()).await;
        Ok(revoked)
    }

    /// Ends the session owning the presented access token, if any.
    pub async fn end_session_by_access_jti(&self, access_jti: &str) -> Result<bool, AppError> {
        match session_repo::find_session_by_access_jti(&self.pool, access_jti).await? {
            Some(session) => {
                self.end_session(&session).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Revokes a session's token pair and deletes the row atomically.
    pub async fn end_session(&self, session: &Session) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        token_repo::revoke_token(&mut *tx, &session.access_jti).await?;
        token_repo::revoke_token(&mut *tx, &session.refresh_jti).await?;
        session_repo::delete_session_by_id(&mut *tx, session.id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        self.revoked.insert(session.access_jti.clone(), ()).await;
        self.revoked.insert(session.refresh_jti.clone(), ()).await;

        self.audit.write(crate::models::audit::AuditRecord::new(
            Some(session.user_id.to_string()),
            "session_ended",
            true,
            Some(json!({"session_id": session.id.to_string()})),
        ));
        Ok(())
    }

    /// Revokes every token and deletes every session of one user (password
    /// change, admin action, "log out everywhere").
    pub async fn end_all_user_sessions(&self, user_id: UserId) -> Result<u64, AppError> {
        let sessions = session_repo::list_sessions_for_user(&self.pool, user_id).await?;

        let mut tx = self.pool.begin().await.map_err(anyhow::Error::from)?;
        token_repo::revoke_tokens_for_user(&mut *tx, user_id).await?;
        let ended = session_repo::delete_sessions_for_user(&mut *tx, user_id).await?;
        tx.commit().await.map_err(anyhow::Error::from)?;

        for session in &sessions {
            self.revoked.insert(session.access_jti.clone(), ()).await;
            self.revoked.insert(session.refresh_jti.clone(), ()).await;
        }

        self.audit.write(crate::models::audit::AuditRecord::new(
            Some(user_id.to_string()),
            "sessions_ended_all",
            true,
            Some(json!({"count": ended})),
        ));
        Ok(ended)
    }

    pub async fn find_session(&self, session_id: SessionId) -> Result<Option<Session>, AppError> {
        Ok(session_repo::find_session_by_id(&self.pool, session_id).await?)
    }

    pub async fn list_sessions(&self, user_id: UserId) -> Result<Vec<Session>, AppError> {
        Ok(session_repo::list_sessions_for_user(&self.pool, user_id).await?)
    }

    fn mint(&self, user: &User, kind: TokenKind) -> Result<(String, Claims), AppError> {
        let ttl = match kind {
            TokenKind::Access => self.config.access_token_ttl(),
            TokenKind::Refresh => self.config.refresh_token_ttl(),
        };
        create_token(
            user.id.to_string(),
            user.username.clone(),
            user.roles.clone(),
            kind,
            // Scopes mirror the user's roles until scoped clients exist.
            user.roles.clone(),
            &self.config.jwt_secret,
            ttl,
        )
        .map_err(AppError::InternalServerError)
    }
}

fn record_for(user_id: UserId, claims: &Claims) -> TokenRecord {
    TokenRecord {
        jti: claims.jti.clone(),
        user_id,
        kind: claims.kind,
        scopes: claims.scopes.clone(),
        issued_at: chrono::DateTime::from_timestamp(claims.iat, 0).unwrap_or_else(Utc::now),
        expires_at: chrono::DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now),
        revoked: false,
        revoked_at: None,
    }
}

pub type SharedTokenService = Arc<TokenService>;
