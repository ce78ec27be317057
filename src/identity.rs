//! Credential verification.
//!
//! The broker resolves a connection's bearer credential once, through an
//! [`IdentityVerifier`], into the owner id used for writes and visibility.

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{BrokerError, Result};

/// Resolves a presented credential to an owner id.
pub trait IdentityVerifier: Send + Sync {
    /// Return the owner id for `credential`, or `BrokerError::Authorization`.
    fn verify(&self, credential: &str) -> Result<String>;
}

/// Fixed token → owner table.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, owner: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), owner.into());
        self
    }
}

impl IdentityVerifier for StaticTokens {
    fn verify(&self, credential: &str) -> Result<String> {
        self.tokens
            .get(credential)
            .cloned()
            .ok_or_else(BrokerError::invalid_token)
    }
}

/// Claims carried by an owner token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerClaims {
    /// Must be `"token"`.
    #[serde(rename = "type")]
    pub token_type: String,

    pub owner_id: String,

    /// Expiration time (Unix timestamp), optional.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
}

impl OwnerClaims {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            token_type: "token".to_string(),
            owner_id: owner_id.into(),
            exp: None,
        }
    }
}

/// HS256 bearer tokens signed with a shared secret.
pub struct HmacTokenVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for HmacTokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacTokenVerifier")
            .field("algorithm", &"HS256")
            .finish()
    }
}

impl HmacTokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        // exp is optional for owner tokens
        validation.required_spec_claims.clear();

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl IdentityVerifier for HmacTokenVerifier {
    fn verify(&self, credential: &str) -> Result<String> {
        let data = decode::<OwnerClaims>(credential, &self.decoding_key, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "token rejected");
                BrokerError::invalid_token()
            })?;

        if data.claims.token_type != "token" {
            return Err(BrokerError::invalid_token());
        }

        Ok(data.claims.owner_id)
    }
}
