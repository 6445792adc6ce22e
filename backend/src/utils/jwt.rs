use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::token::TokenKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user_id
    pub username: String,
    pub roles: Vec<String>,
    pub kind: TokenKind,
    pub scopes: Vec<String>,
    pub exp: i64,    // expiration time
    pub iat: i64,    // issued at
    pub jti: String, // JWT ID
}

impl Claims {
    pub fn new(
        user_id: String,
        username: String,
        roles: Vec<String>,
        kind: TokenKind,
        scopes: Vec<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        let exp = now + ttl;

        Self {
            sub: user_id,
            username,
            roles,
            kind,
            scopes,
            exp: exp.timestamp(),
            iat: now.timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|role| role == "admin")
    }
}

pub fn create_token(
    user_id: String,
    username: String,
    roles: Vec<String>,
    kind: TokenKind,
    scopes: Vec<String>,
    secret: &str,
    ttl: Duration,
) -> anyhow::Result<(String, Claims)> {
    let claims = Claims::new(user_id, username, roles, kind, scopes, ttl);
    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_ref()),
    )?;

    Ok((token, claims))
}

/// Decodes a token, checking signature and expiry, and rejects tokens of the
/// wrong kind (an access token presented as refresh and vice versa).
pub fn verify_token(token: &str, secret: &str, expected: TokenKind) -> anyhow::Result<Claims> {
    let validation = Validation::default();
    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_ref()),
        &validation,
    )?;

    if token_data.claims.kind != expected {
        return Err(anyhow::anyhow!(
            "Expected {} token, got {}",
            expected.as_str(),
            token_data.claims.kind.as_str()
        ));
    }

    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-secret";

    fn mint(kind: TokenKind) -> (String, Claims) {
        create_token(
            "user-123".into(),
            "bob".into(),
            vec!["admin".into(), "user".into()],
            kind,
            vec!["profile".into()],
            SECRET,
            Duration::hours(1),
        )
        .expect("create token")
    }

    #[test]
    fn create_and_verify_access_token() {
        let (token, _) = mint(TokenKind::Access);
        let claims = verify_token(&token, SECRET, TokenKind::Access).expect("verify token");
        assert_eq!(claims.sub, "user-123");
        assert_eq!(claims.username, "bob");
        assert!(claims.is_admin());
        assert_eq!(claims.scopes, vec!["profile".to_string()]);
    }

    #[test]
    fn rejects_wrong_kind() {
        let (token, _) = mint(TokenKind::Refresh);
        assert!(verify_token(&token, SECRET, TokenKind::Access).is_err());
        assert!(verify_token(&token, SECRET, TokenKind::Refresh).is_ok());
    }

    #[test]
    fn rejects_wrong_secret() {
        let (token, _) = mint(TokenKind::Access);
        assert!(verify_token(&token, "another-secret", TokenKind::Access).is_err());
    }

    #[test]
    fn rejects_expired_token() {
        let (token, _) = create_token(
            "user-123".into(),
            "bob".into(),
            vec![],
            TokenKind::Access,
            vec![],
            SECRET,
            Duration::seconds(-3600),
        )
        .expect("create token");
        assert!(verify_token(&token, SECRET, TokenKind::Access).is_err());
    }
}
