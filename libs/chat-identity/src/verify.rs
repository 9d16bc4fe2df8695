//! `VerifyToken` (§4.1): wraps the external identity provider. Whatever the
//! provider's own error taxonomy looks like, only one opaque kind crosses
//! this boundary — callers never see provider-specific detail.

use async_trait::async_trait;
use chat_core::AuthContext;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
#[error("invalid token")]
pub struct InvalidToken;

#[async_trait]
pub trait VerifyToken: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthContext, InvalidToken>;
}

/// Claims carried by a bearer token signed by the identity provider, HS256.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default)]
    tenant_id: Option<String>,
    #[serde(default)]
    tenant_role: Option<String>,
    #[serde(default)]
    platform_role: Option<String>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[allow(dead_code)]
    exp: i64,
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl VerifyToken for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<AuthContext, InvalidToken> {
        let data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|err| {
            warn!(error = %err, "token verification failed");
            InvalidToken
        })?;
        let claims = data.claims;
        Ok(AuthContext {
            user_id: claims.sub,
            tenant_id: claims.tenant_id,
            tenant_role: claims.tenant_role,
            platform_role: claims.platform_role,
            email: claims.email,
            display_name: claims.display_name,
        })
    }
}

/// Fixed-table verifier for tests and local development without a running
/// identity provider.
#[derive(Default)]
pub struct StaticVerifier {
    tokens: std::collections::HashMap<String, AuthContext>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, ctx: AuthContext) -> Self {
        self.tokens.insert(token.into(), ctx);
        self
    }
}

#[async_trait]
impl VerifyToken for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<AuthContext, InvalidToken> {
        self.tokens.get(token).cloned().ok_or(InvalidToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use time::{Duration, OffsetDateTime};

    fn token_for(secret: &str, claims: &Claims) -> String {
        encode(&Header::new(Algorithm::HS256), claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn valid_token_round_trips_claims() {
        let exp = (OffsetDateTime::now_utc() + Duration::minutes(5)).unix_timestamp();
        let claims = Claims {
            sub: "u1".into(),
            tenant_id: Some("t1".into()),
            tenant_role: Some("owner".into()),
            platform_role: None,
            email: Some("u1@example.com".into()),
            display_name: None,
            exp,
        };
        let token = token_for("secret", &claims);
        let verifier = JwtVerifier::new("secret");
        let ctx = verifier.verify(&token).await.unwrap();
        assert_eq!(ctx.user_id, "u1");
        assert_eq!(ctx.tenant_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected_opaquely() {
        let exp = (OffsetDateTime::now_utc() + Duration::minutes(5)).unix_timestamp();
        let claims = Claims {
            sub: "u1".into(),
            tenant_id: None,
            tenant_role: None,
            platform_role: None,
            email: None,
            display_name: None,
            exp,
        };
        let token = token_for("secret", &claims);
        let verifier = JwtVerifier::new("other-secret");
        assert!(verifier.verify(&token).await.is_err());
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let exp = (OffsetDateTime::now_utc() - Duration::minutes(5)).unix_timestamp();
        let claims = Claims {
            sub: "u1".into(),
            tenant_id: None,
            tenant_role: None,
            platform_role: None,
            email: None,
            display_name: None,
            exp,
        };
        let token = token_for("secret", &claims);
        let verifier = JwtVerifier::new("secret");
        assert!(verifier.verify(&token).await.is_err());
    }
}
