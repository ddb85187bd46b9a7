//! SHA-256 digests used for artifact verification and cache keys.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

/// Errors produced when validating a [`Sha256Digest`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DigestError {
    /// The hex portion was not exactly 64 characters long.
    #[error("invalid SHA256 digest: expected 64 hex characters, got {len} in '{input}'")]
    Length {
        /// Offending input.
        input: String,
        /// Length of its hex portion.
        len: usize,
    },

    /// The hex portion contained a non-hex character.
    #[error("invalid SHA256 digest: contains non-hex characters in '{0}'")]
    NotHex(String),
}

/// A validated SHA256 digest (64 hex characters, stored lowercase).
///
/// Digests are validated at deserialization time so invalid hex strings never
/// reach the cache, where they would otherwise become storage keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Sha256Digest(String);

impl Sha256Digest {
    /// Create a new `Sha256Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha256:` prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the hex portion is not exactly 64 ASCII hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self, DigestError> {
        let s = s.into();
        let hex = s.trim().strip_prefix("sha256:").unwrap_or(s.trim());

        if hex.len() != 64 {
            return Err(DigestError::Length {
                len: hex.len(),
                input: s.clone(),
            });
        }
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DigestError::NotHex(s.clone()));
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha256Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl FromStr for Sha256Digest {
    type Err = DigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
