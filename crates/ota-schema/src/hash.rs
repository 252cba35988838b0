//! Validated hash newtypes.

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize};

/// A validated SHA256 digest (64 hex characters).
///
/// This newtype ensures that all digests in the system are validated at
/// deserialization time, preventing invalid hex strings from propagating
/// through the pipeline and being compared against computed hashes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
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
    pub fn new(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let hex = s.strip_prefix("sha256:").unwrap_or(&s);

        if hex.len() != 64 {
            anyhow::bail!(
                "Invalid SHA256 digest: expected 64 hex characters, got {} in '{s}'",
                hex.len(),
            );
        }

        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            anyhow::bail!("Invalid SHA256 digest: contains non-hex characters in '{s}'");
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Wrap raw digest bytes produced by a hasher.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self(hex::encode(bytes))
    }

    /// Get the digest as a string slice.
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

impl std::fmt::Display for Sha256Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha256Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
