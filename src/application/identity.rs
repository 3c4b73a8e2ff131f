//! Bearer-credential verification.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::domain::entities::Requester;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("missing or unknown credential")]
    Unauthorized,
    #[error("requester lacks the required role")]
    Forbidden,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, bearer: &str) -> Result<Requester, IdentityError>;
}

/// Admin-only operations gate on this.
pub fn require_admin(requester: &Requester) -> Result<(), IdentityError> {
    if requester.is_admin() {
        Ok(())
    } else {
        Err(IdentityError::Forbidden)
    }
}

/// Verifier over a fixed set of tokens, held only as SHA-256 digests.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    entries: Vec<(Vec<u8>, Requester)>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plaintext token.
    pub fn with_token(mut self, token: &str, requester: Requester) -> Self {
        self.entries.push((hash_token(token), requester));
        self
    }

    /// Register a token by its lowercase hex SHA-256 digest, as stored in configuration.
    pub fn with_digest(mut self, digest_hex: &str, requester: Requester) -> Result<Self, hex::FromHexError> {
        let digest = hex::decode(digest_hex.trim())?;
        self.entries.push((digest, requester));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl IdentityVerifier for StaticTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<Requester, IdentityError> {
        let token = bearer
            .strip_prefix("Bearer ")
            .unwrap_or(bearer)
            .trim();
        if token.is_empty() {
            return Err(IdentityError::Unauthorized);
        }

        let hashed = hash_token(token);
        self.entries
            .iter()
            .find(|(digest, _)| digest.ct_eq(&hashed).unwrap_u8() == 1)
            .map(|(_, requester)| requester.clone())
            .ok_or(IdentityError::Unauthorized)
    }
}

pub fn hash_token(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}
