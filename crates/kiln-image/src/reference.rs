//! Image reference parsing.
//!
//! Base images are read from OCI image layout directories, addressed the
//! same way as skopeo's `oci:` transport: `[oci:]path[:tag]`.

use std::path::PathBuf;
use std::str::FromStr;

use kiln_common::{KilnError, KilnResult};

/// A parsed reference to an image inside an OCI layout directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Layout directory.
    pub path: PathBuf,
    /// Tag selecting a manifest from the layout index, if any.
    pub tag: Option<String>,
}

impl ImageReference {
    /// Optional transport prefix.
    pub const TRANSPORT: &'static str = "oci:";

    /// Parse an image reference string.
    ///
    /// Examples:
    /// - `/images/alpine` -> the only manifest in `/images/alpine`
    /// - `/images/alpine:3.19` -> manifest tagged `3.19`
    /// - `oci:./busybox:latest` -> manifest tagged `latest` in `./busybox`
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::ImageNotFound`] for an empty path or tag.
    pub fn parse(reference: &str) -> KilnResult<Self> {
        let reference = reference.trim();
        let reference = reference.strip_prefix(Self::TRANSPORT).unwrap_or(reference);

        let (path, tag) = match reference.rfind(':') {
            // A colon followed by a slash belongs to the path.
            Some(idx) if !reference[idx + 1..].contains('/') => {
                (&reference[..idx], Some(reference[idx + 1..].to_string()))
            }
            _ => (reference, None),
        };

        if path.is_empty() || tag.as_deref() == Some("") {
            return Err(KilnError::ImageNotFound {
                reference: reference.to_string(),
            });
        }

        Ok(Self {
            path: PathBuf::from(path),
            tag,
        })
    }
}

impl FromStr for ImageReference {
    type Err = KilnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.tag {
            Some(tag) => write!(f, "{}{}:{}", Self::TRANSPORT, self.path.display(), tag),
            None => write!(f, "{}{}", Self::TRANSPORT, self.path.display()),
        }
    }
}
