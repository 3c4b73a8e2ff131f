//! Content fingerprint of a render request.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::error::DomainError;
use super::request::RenderRequest;

const FINGERPRINT_LEN: usize = 64;

/// Lowercase hex SHA-256 of [`RenderRequest::canonical_form`]. The only stable external
/// identifier for jobs and artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Pure and total: every resolved request has a fingerprint.
    pub fn of(request: &RenderRequest) -> Self {
        let digest = Sha256::digest(request.canonical_form().as_bytes());
        Self(hex::encode(digest))
    }

    /// Accept an externally supplied fingerprint, e.g. from a status poll.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        let trimmed = raw.trim();
        if trimmed.len() != FINGERPRINT_LEN
            || !trimmed
                .bytes()
                .all(|byte| byte.is_ascii_digit() || (b'a'..=b'f').contains(&byte))
        {
            return Err(DomainError::validation(format!(
                "`{raw}` is not a valid fingerprint"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Object-store key of the rendered PNG.
    pub fn artifact_key(&self) -> String {
        format!("fractals/{}.png", self.0)
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.0
    }
}
