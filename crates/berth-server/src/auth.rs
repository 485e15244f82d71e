// Copyright (C) 2025 Berth Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bearer-token verification.
//!
//! Caller identity arrives as a JWT signed with the platform secret.
//! Verification sits behind a trait so long-lived streams can re-validate
//! mid-connection and tests can script expiry.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Verification failures.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No bearer token on the request.
    #[error("Missing bearer token")]
    MissingToken,

    /// Token failed verification.
    #[error("Token rejected: {0}")]
    InvalidToken(String),
}

/// Identity extracted from a verified token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// User id, from the `sub` claim.
    pub user_id: Uuid,
    /// Username, carried into job payloads for worker-side audit.
    pub username: String,
}

/// Token verification seam.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify a bearer token and extract the caller's identity.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Registered claims plus the platform's username claim.
#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    username: String,
    exp: i64,
}

/// HS256 JWT verifier over the shared platform secret.
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Build from the shared HMAC secret.
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;
        let user_id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| AuthError::InvalidToken("sub claim is not a uuid".to_string()))?;
        Ok(Identity {
            user_id,
            username: data.claims.username,
        })
    }
}

/// Static token table for tests and local development.
///
/// Tokens map to fixed identities. Revoking one makes in-flight streams
/// observe expiry at their next validation tick.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: std::sync::Mutex<std::collections::HashMap<String, Identity>>,
}

impl StaticTokenVerifier {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a token for an identity.
    pub fn issue(&self, token: &str, identity: Identity) {
        self.tokens
            .lock()
            .unwrap()
            .insert(token.to_string(), identity);
    }

    /// Invalidate a token.
    pub fn revoke(&self, token: &str) {
        self.tokens.lock().unwrap().remove(token);
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .lock()
            .unwrap()
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".to_string()))
    }
}
