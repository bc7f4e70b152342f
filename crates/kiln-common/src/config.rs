//! Config file loading.
//!
//! The config file is optional TOML. Every value in it is a default that
//! command-line flags override.
//!
//! ```toml
//! store = "/var/lib/kiln"
//! disk_limit = "10Gi"
//! exclude_image_from_quota = false
//! uid_mappings = ["0:100000:65536"]
//! gid_mappings = ["0:100000:65536"]
//! owner_uid = 0
//! owner_gid = 0
//! log_level = "info"
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{KilnError, KilnResult};
use crate::idmap::IdMapping;
use crate::resource::ByteSize;

/// Values loaded from the Kiln config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    /// Store root directory.
    pub store: Option<PathBuf>,
    /// Disk limit applied to materialized images.
    pub disk_limit: Option<ByteSize>,
    /// Skip the image size check against the disk limit.
    pub exclude_image_from_quota: bool,
    /// UID mappings used to unpack namespaced images.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings used to unpack namespaced images.
    pub gid_mappings: Vec<IdMapping>,
    /// Owner UID forced on created volumes.
    pub owner_uid: Option<u32>,
    /// Owner GID forced on created volumes.
    pub owner_gid: Option<u32>,
    /// Default log filter directive (e.g. "debug").
    pub log_level: Option<String>,
}

impl KilnConfig {
    /// Parse a config from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or has unknown keys.
    pub fn from_toml(text: &str) -> KilnResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Load a config file.
    ///
    /// A missing file yields the default config unless `required` is set.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path, required: bool) -> KilnResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                tracing::debug!(path = %path.display(), "Loaded config file");
                Self::from_toml(&text).map_err(|e| KilnError::Config {
                    message: format!("{}: {e}", path.display()),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                Ok(Self::default())
            }
            Err(e) => Err(KilnError::Config {
                message: format!("failed to read {}: {e}", path.display()),
            }),
        }
    }
}
