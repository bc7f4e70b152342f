//! Standard filesystem paths for Kiln.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default store root for Kiln data.
pub static KILN_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("KILN_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/kiln"))
});

/// Default location of the config file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kiln/config.toml";

/// Marker that separates a volume ID from the nonce of its staging name.
pub const INCOMPLETE_MARKER: &str = "-incomplete-";

/// Standard paths used by the volume store.
#[derive(Debug, Clone)]
pub struct KilnPaths {
    /// Store root directory (default: /var/lib/kiln).
    pub root: PathBuf,
}

impl KilnPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding published and staging volumes.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Directory for a volume by its on-disk name.
    #[must_use]
    pub fn volume(&self, name: &str) -> PathBuf {
        self.volumes().join(name)
    }

    /// Directory for volume metadata.
    #[must_use]
    pub fn meta(&self) -> PathBuf {
        self.root.join("meta")
    }

    /// Metadata file for a chain.
    #[must_use]
    pub fn volume_meta(&self, chain_id: &str) -> PathBuf {
        self.meta().join(format!("volume-{chain_id}.json"))
    }

    /// Directory for per-chain lock files.
    #[must_use]
    pub fn locks(&self) -> PathBuf {
        self.root.join("locks")
    }

    /// Lock file for a named resource.
    #[must_use]
    pub fn lock(&self, key: &str) -> PathBuf {
        self.locks().join(format!("{key}.lock"))
    }

    /// Scratch directory on the same filesystem as the volumes.
    #[must_use]
    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.volumes())?;
        std::fs::create_dir_all(self.meta())?;
        std::fs::create_dir_all(self.locks())?;
        std::fs::create_dir_all(self.tmp())?;
        Ok(())
    }
}

impl Default for KilnPaths {
    fn default() -> Self {
        Self {
            root: KILN_ROOT.clone(),
        }
    }
}
