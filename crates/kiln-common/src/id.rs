//! Chain, volume and digest identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{KilnError, KilnResult};

/// Suffix appended to volume IDs of chains unpacked with ID mappings.
pub const NAMESPACED_SUFFIX: &str = "-namespaced";

/// A validated layer chain ID.
///
/// Chain IDs are used directly as file names in the volume store, so they
/// must:
/// - Be 1-128 characters long
/// - Contain only ASCII alphanumerics, `.`, `-` and `_`
/// - Not start with `.`
///
/// A `sha256:` prefix is stripped on construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChainId(String);

impl ChainId {
    /// Maximum length of a chain ID.
    pub const MAX_LENGTH: usize = 128;

    /// Create a new chain ID, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> KilnResult<Self> {
        let id = id.into();
        let id = match id.strip_prefix("sha256:") {
            Some(hex) => hex.to_string(),
            None => id,
        };
        validate(&id)?;
        Ok(Self(id))
    }

    /// Get the chain ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short version of the ID (first 12 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        if self.0.len() <= 12 {
            &self.0
        } else {
            &self.0[..12]
        }
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChainId {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ChainId {
    type Error = KilnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ChainId> for String {
    fn from(id: ChainId) -> Self {
        id.0
    }
}

impl AsRef<str> for ChainId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The on-disk identity of a chain's volume.
///
/// Chains unpacked with UID/GID mappings live under a distinct, suffixed
/// identity so they never alias the unmapped volume of the same chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// Volume ID for a chain, wrapped when the chain is namespaced.
    #[must_use]
    pub fn for_chain(chain_id: &ChainId, namespaced: bool) -> Self {
        if namespaced {
            Self(format!("{}{NAMESPACED_SUFFIX}", chain_id.as_str()))
        } else {
            Self(chain_id.as_str().to_string())
        }
    }

    /// Parse a volume ID read back from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID format is invalid.
    pub fn new(id: impl Into<String>) -> KilnResult<Self> {
        let id = id.into();
        validate(&id)?;
        Ok(Self(id))
    }

    /// Get the volume ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this volume belongs to a namespaced chain.
    #[must_use]
    pub fn is_namespaced(&self) -> bool {
        self.0.ends_with(NAMESPACED_SUFFIX)
    }

    /// The chain ID this volume was derived from.
    ///
    /// # Errors
    ///
    /// Returns an error if the unwrapped ID is not a valid chain ID.
    pub fn chain_id(&self) -> KilnResult<ChainId> {
        ChainId::new(
            self.0
                .strip_suffix(NAMESPACED_SUFFIX)
                .unwrap_or(&self.0)
                .to_string(),
        )
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for VolumeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

fn validate(id: &str) -> KilnResult<()> {
    let invalid = || KilnError::InvalidId { id: id.to_string() };

    if id.is_empty() || id.len() > ChainId::MAX_LENGTH || id.starts_with('.') {
        return Err(invalid());
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err(invalid());
    }

    Ok(())
}

/// A content-addressable digest (e.g., sha256:abc123...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// The algorithm used (e.g., "sha256").
    pub algorithm: String,
    /// The hex-encoded hash.
    pub hash: String,
}

impl Digest {
    /// Create a new digest.
    #[must_use]
    pub fn new(algorithm: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            algorithm: algorithm.into(),
            hash: hash.into(),
        }
    }

    /// Create a SHA-256 digest.
    #[must_use]
    pub fn sha256(hash: impl Into<String>) -> Self {
        Self::new("sha256", hash)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hash)
    }
}

impl FromStr for Digest {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((algorithm, hash))
                if !algorithm.is_empty()
                    && algorithm.chars().all(|c| c.is_ascii_alphanumeric())
                    && !hash.is_empty()
                    && hash.chars().all(|c| c.is_ascii_hexdigit()) =>
            {
                Ok(Self::new(algorithm, hash))
            }
            _ => Err(KilnError::InvalidId { id: s.to_string() }),
        }
    }
}
