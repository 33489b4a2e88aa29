use futures::future::BoxFuture;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{ChatError, ChatResult};

/// The authenticated caller attached to every request and session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub username: String,
    pub organization_id: Uuid,
}

/// Claims stored within issued JWTs.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Claims {
    pub sub: String,
    pub username: String,
    pub org: String,
    pub exp: usize,
}

/// Turns a bearer credential into an identity.
pub trait CredentialValidator: Send + Sync {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, ChatResult<Identity>>;
}

/// HS256 validator over a shared secret.
pub struct JwtValidator {
    secret: Vec<u8>,
}

impl JwtValidator {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }
}

impl CredentialValidator for JwtValidator {
    fn validate<'a>(&'a self, token: &'a str) -> BoxFuture<'a, ChatResult<Identity>> {
        Box::pin(async move { verify_jwt(&self.secret, token) })
    }
}

/// Issue a JWT for `identity` valid for the provided duration.
pub fn issue_jwt(secret: &[u8], identity: &Identity, valid_for: Duration) -> jsonwebtoken::errors::Result<String> {
    let exp = (OffsetDateTime::now_utc() + valid_for).unix_timestamp() as usize;
    let claims = Claims {
        sub: identity.user_id.to_string(),
        username: identity.username.clone(),
        org: identity.organization_id.to_string(),
        exp,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret))
}

/// Verify a JWT and return the identity it carries.
pub fn verify_jwt(secret: &[u8], token: &str) -> ChatResult<Identity> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation).map_err(|e| {
        tracing::debug!(error = %e, "rejected credential");
        ChatError::Unauthenticated
    })?;
    let claims = data.claims;
    let user_id = Uuid::parse_str(&claims.sub).map_err(|_| ChatError::Unauthenticated)?;
    let organization_id = Uuid::parse_str(&claims.org).map_err(|_| ChatError::Unauthenticated)?;
    if claims.username.trim().is_empty() {
        return Err(ChatError::Unauthenticated);
    }
    Ok(Identity {
        user_id,
        username: claims.username,
        organization_id,
    })
}
