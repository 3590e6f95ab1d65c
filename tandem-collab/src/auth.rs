//! Credential verification for the upgrade route.
//!
//! The sync engine only needs `token → user id`. Credentials arrive either as
//! an `Authorization: Bearer <token>` header or, for browser clients that
//! cannot set headers on a WebSocket handshake, as a `token` query parameter.

use std::collections::HashMap;
use std::time::Duration;

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::protocol::{unix_timestamp, UserId};

/// Authentication errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingCredential,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("failed to issue token: {0}")]
    Issue(String),
}

/// Resolves a credential to the user it belongs to.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Token claims: the user id and an expiry in unix seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub exp: u64,
}

/// HS256 JWT verification with a shared secret.
pub struct JwtAuthenticator {
    key: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl Authenticator for JwtAuthenticator {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims.user_id)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

/// Mint an HS256 token for `user_id` valid for `ttl`.
pub fn issue_token(secret: &str, user_id: UserId, ttl: Duration) -> Result<String, AuthError> {
    let claims = Claims {
        user_id,
        exp: unix_timestamp().max(0) as u64 + ttl.as_secs(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Issue(e.to_string()))
}

/// Fixed token table, for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, UserId>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, token: impl Into<String>, user_id: UserId) -> Self {
        self.tokens.insert(token.into(), user_id);
        self
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, token: &str) -> Result<UserId, AuthError> {
        self.tokens
            .get(token)
            .copied()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".into()))
    }
}

/// Extract the token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
