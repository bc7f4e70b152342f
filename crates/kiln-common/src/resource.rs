//! Byte-size quantity parsing.
//!
//! Accepts Kubernetes-style memory quantities:
//! - "128Ki", "512Mi", "10Gi", "1Ti" (powers of 1024)
//! - "128k", "512M", "10G", "1T" (powers of 1000)
//! - "1024" (plain bytes)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, KilnResult};

/// A quantity of bytes, used for disk limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteSize(u64);

impl ByteSize {
    /// Zero bytes, which disk limits treat as "unlimited".
    pub const ZERO: Self = Self(0);

    /// Create a quantity from bytes.
    #[must_use]
    pub const fn bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create a quantity from mebibytes (MiB).
    #[must_use]
    pub const fn mebibytes(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Create a quantity from gibibytes (GiB).
    #[must_use]
    pub const fn gibibytes(gib: u64) -> Self {
        Self(gib * 1024 * 1024 * 1024)
    }

    /// Get the raw value in bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Parse a byte quantity string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not a valid quantity or overflows.
    pub fn parse(s: &str) -> KilnResult<Self> {
        let s = s.trim();
        let invalid = || KilnError::InvalidSize {
            value: s.to_string(),
        };

        // Binary suffixes (powers of 1024)
        let binary_suffixes = [
            ("Ki", 1024u64),
            ("Mi", 1024 * 1024),
            ("Gi", 1024 * 1024 * 1024),
            ("Ti", 1024 * 1024 * 1024 * 1024),
        ];

        // Decimal suffixes (powers of 1000)
        let decimal_suffixes = [
            ("k", 1000u64),
            ("K", 1000),
            ("M", 1000 * 1000),
            ("G", 1000 * 1000 * 1000),
            ("T", 1000 * 1000 * 1000 * 1000),
        ];

        for (suffix, multiplier) in binary_suffixes.into_iter().chain(decimal_suffixes) {
            if let Some(stripped) = s.strip_suffix(suffix) {
                let value: u64 = stripped.parse().map_err(|_| invalid())?;
                return value.checked_mul(multiplier).map(Self).ok_or_else(invalid);
            }
        }

        s.parse().map(Self).map_err(|_| invalid())
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const GI: u64 = 1024 * 1024 * 1024;
        const MI: u64 = 1024 * 1024;
        const KI: u64 = 1024;

        if self.0 >= GI && self.0 % GI == 0 {
            write!(f, "{}Gi", self.0 / GI)
        } else if self.0 >= MI && self.0 % MI == 0 {
            write!(f, "{}Mi", self.0 / MI)
        } else if self.0 >= KI && self.0 % KI == 0 {
            write!(f, "{}Ki", self.0 / KI)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl FromStr for ByteSize {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ByteSize {
    type Error = KilnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ByteSize> for String {
    fn from(size: ByteSize) -> Self {
        size.to_string()
    }
}
