//! UID/GID mapping ranges for namespaced volumes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, KilnResult};

/// UID/GID mapping entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdMapping {
    /// Container ID (start of range).
    pub container_id: u32,
    /// Host ID (start of range).
    pub host_id: u32,
    /// Size of the range.
    pub size: u32,
}

impl IdMapping {
    /// Create a new ID mapping.
    #[must_use]
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    /// Format for /proc/<pid>/uid_map or gid_map.
    #[must_use]
    pub fn to_proc_format(&self) -> String {
        format!("{} {} {}", self.container_id, self.host_id, self.size)
    }

    /// Translate a container ID to the host, if this range covers it.
    #[must_use]
    pub fn to_host(&self, id: u32) -> Option<u32> {
        let offset = id.checked_sub(self.container_id)?;
        if offset < self.size {
            self.host_id.checked_add(offset)
        } else {
            None
        }
    }

    /// Parse a `container:host:size` string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is malformed or the size is zero.
    pub fn parse(s: &str) -> KilnResult<Self> {
        let invalid = || KilnError::InvalidIdMapping {
            value: s.to_string(),
        };

        let mut parts = s.trim().split(':');
        let (Some(container), Some(host), Some(size), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let mapping = Self::new(
            container.parse().map_err(|_| invalid())?,
            host.parse().map_err(|_| invalid())?,
            size.parse().map_err(|_| invalid())?,
        );

        if mapping.size == 0 {
            return Err(invalid());
        }

        Ok(mapping)
    }
}

/// Translate a container ID through a set of mappings.
///
/// IDs not covered by any range map to the overflow ID 65534, matching
/// the kernel's behaviour for unmapped IDs.
#[must_use]
pub fn map_to_host(mappings: &[IdMapping], id: u32) -> u32 {
    if mappings.is_empty() {
        return id;
    }

    mappings
        .iter()
        .find_map(|m| m.to_host(id))
        .unwrap_or(OVERFLOW_ID)
}

/// Kernel overflow UID/GID.
pub const OVERFLOW_ID: u32 = 65534;

/// Render mappings in /proc/<pid>/{uid,gid}_map format.
#[must_use]
pub fn to_proc_map(mappings: &[IdMapping]) -> String {
    mappings
        .iter()
        .map(IdMapping::to_proc_format)
        .collect::<Vec<_>>()
        .join("\n")
}

impl fmt::Display for IdMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.container_id, self.host_id, self.size)
    }
}

impl FromStr for IdMapping {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for IdMapping {
    type Error = KilnError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<IdMapping> for String {
    fn from(mapping: IdMapping) -> Self {
        mapping.to_string()
    }
}
