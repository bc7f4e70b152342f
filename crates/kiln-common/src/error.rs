//! Common error types for Kiln.

use std::fmt;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`KilnError`].
pub type KilnResult<T> = Result<T, KilnError>;

/// The step of a single layer build that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerPhase {
    /// Acquiring the per-chain lock.
    Lock,
    /// Opening the layer stream.
    Download,
    /// Creating the staging volume.
    Create,
    /// Copying the declared base directory forward.
    BaseDirectory,
    /// Populating the staging volume.
    Unpack,
    /// Forcing the owner of the volume root.
    Ownership,
    /// Renaming the staging volume to its final name.
    Publish,
    /// Recording volume metadata.
    Metadata,
}

impl fmt::Display for LayerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lock => write!(f, "lock"),
            Self::Download => write!(f, "download"),
            Self::Create => write!(f, "create"),
            Self::BaseDirectory => write!(f, "base-directory"),
            Self::Unpack => write!(f, "unpack"),
            Self::Ownership => write!(f, "ownership"),
            Self::Publish => write!(f, "publish"),
            Self::Metadata => write!(f, "metadata"),
        }
    }
}

/// Common errors across Kiln.
#[derive(Error, Diagnostic, Debug)]
pub enum KilnError {
    /// The declared image size does not fit the disk limit.
    #[error("layers are bigger than the disk limit: {total} > {limit} bytes")]
    #[diagnostic(
        code(kiln::quota::exceeded),
        help("Raise --disk-limit or pass --exclude-image-from-quota")
    )]
    QuotaExceeded {
        /// Sum of the declared layer sizes.
        total: u64,
        /// Configured disk limit.
        limit: u64,
    },

    /// Building one layer of the chain failed.
    #[error("layer {blob_id} (chain {chain_id}) failed during {phase}")]
    #[diagnostic(code(kiln::layer::failed))]
    LayerFailed {
        /// Step that failed.
        phase: LayerPhase,
        /// Blob the layer was streamed from.
        blob_id: String,
        /// Chain ID of the layer.
        chain_id: String,
        /// Underlying error.
        #[source]
        source: Box<KilnError>,
    },

    /// No layers were supplied.
    #[error("image has no layers")]
    #[diagnostic(code(kiln::image::empty))]
    EmptyImage,

    /// Image not found in a layer source.
    #[error("Image not found: {reference}")]
    #[diagnostic(code(kiln::image::not_found))]
    ImageNotFound {
        /// The image reference that was not found.
        reference: String,
    },

    /// Blob not found in a layer source.
    #[error("Blob not found: {digest}")]
    #[diagnostic(code(kiln::image::blob_not_found))]
    BlobNotFound {
        /// Digest of the missing blob.
        digest: String,
    },

    /// Blob content did not hash to its digest.
    #[error("Blob {digest} failed verification: got {actual}")]
    #[diagnostic(code(kiln::image::digest_mismatch))]
    DigestMismatch {
        /// Expected digest.
        digest: String,
        /// Computed digest.
        actual: String,
    },

    /// Volume not found in the store.
    #[error("Volume not found: {id}")]
    #[diagnostic(code(kiln::volume::not_found))]
    VolumeNotFound {
        /// The volume ID that was not found.
        id: String,
    },

    /// Invalid chain or volume ID.
    #[error("Invalid ID: {id}")]
    #[diagnostic(
        code(kiln::id::invalid),
        help("IDs must be 1-128 characters of [A-Za-z0-9._-] and may not start with '.'")
    )]
    InvalidId {
        /// The invalid ID.
        id: String,
    },

    /// Malformed `container:host:size` ID mapping.
    #[error("Invalid ID mapping: {value}")]
    #[diagnostic(
        code(kiln::idmap::invalid),
        help("Use the form 'container_id:host_id:size', e.g. '0:100000:65536'")
    )]
    InvalidIdMapping {
        /// The invalid value.
        value: String,
    },

    /// Invalid byte-size quantity.
    #[error("Invalid size: {value}")]
    #[diagnostic(
        code(kiln::resource::invalid_size),
        help("Use formats like '512Mi', '10Gi', '1G' or a plain byte count")
    )]
    InvalidSize {
        /// The invalid value.
        value: String,
    },

    /// A base directory could not be reconciled.
    #[error("Base directory {path}: {message}")]
    #[diagnostic(code(kiln::base_directory))]
    BaseDirectory {
        /// Directory (relative to the image root) being copied up.
        path: PathBuf,
        /// What went wrong.
        message: String,
    },

    /// A re-executed action failed.
    #[error("Re-exec action '{action}' failed: {message}")]
    #[diagnostic(code(kiln::reexec))]
    Reexec {
        /// Registered action name.
        action: String,
        /// Combined output or spawn error.
        message: String,
    },

    /// Lock acquisition failed.
    #[error("Failed to lock {key}: {message}")]
    #[diagnostic(code(kiln::lock))]
    Lock {
        /// Name of the locked resource.
        key: String,
        /// Underlying failure.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(kiln::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(kiln::serialization))]
    Serialization(String),

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(kiln::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(kiln::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(kiln::internal),
        help("This is a bug, please report it at https://github.com/kiln-containers/kiln/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl KilnError {
    /// Wrap an error as a failure of one layer build.
    #[must_use]
    pub fn layer(
        phase: LayerPhase,
        blob_id: impl Into<String>,
        chain_id: impl Into<String>,
        source: Self,
    ) -> Self {
        Self::LayerFailed {
            phase,
            blob_id: blob_id.into(),
            chain_id: chain_id.into(),
            source: Box::new(source),
        }
    }

    /// The failing layer phase, if this is a layer failure.
    #[must_use]
    pub const fn phase(&self) -> Option<LayerPhase> {
        match self {
            Self::LayerFailed { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for KilnError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for KilnError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}
