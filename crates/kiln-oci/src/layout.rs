//! OCI Image Layout directories.
//!
//! An image layout is a directory containing an `oci-layout` marker, an
//! `index.json`, and content-addressed blobs under `blobs/<alg>/<hex>`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use kiln_common::{Digest, KilnError, KilnResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest as _, Sha256};

use crate::image::{Descriptor, ImageIndex, ManifestDescriptor, annotations, media_types};

/// Name of the layout marker file.
pub const LAYOUT_FILE: &str = "oci-layout";
/// Name of the index file.
pub const INDEX_FILE: &str = "index.json";

/// Content of the layout marker file.
const LAYOUT_VERSION: &str = r#"{"imageLayoutVersion":"1.0.0"}"#;

/// An OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Open an image layout.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::ImageNotFound`] if the directory has no
    /// `oci-layout` marker.
    pub fn open(root: impl Into<PathBuf>) -> KilnResult<Self> {
        let root = root.into();

        if !root.join(LAYOUT_FILE).is_file() {
            return Err(KilnError::ImageNotFound {
                reference: root.display().to_string(),
            });
        }

        Ok(Self { root })
    }

    /// Create an empty image layout, or open one that already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be written.
    pub fn init(root: impl Into<PathBuf>) -> KilnResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs").join("sha256"))?;

        if !root.join(LAYOUT_FILE).is_file() {
            fs::write(root.join(LAYOUT_FILE), LAYOUT_VERSION)?;
        }
        if !root.join(INDEX_FILE).is_file() {
            let index = ImageIndex {
                schema_version: 2,
                media_type: Some(media_types::INDEX.to_string()),
                manifests: Vec::new(),
                annotations: HashMap::new(),
            };
            fs::write(root.join(INDEX_FILE), serde_json::to_vec_pretty(&index)?)?;
        }

        Ok(Self { root })
    }

    /// Get the layout root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the blob for a digest.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest is malformed.
    pub fn blob_path(&self, digest: &str) -> KilnResult<PathBuf> {
        let digest: Digest = digest.parse()?;
        Ok(self
            .root
            .join("blobs")
            .join(&digest.algorithm)
            .join(&digest.hash))
    }

    /// Read the top-level index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or parsed.
    pub fn index(&self) -> KilnResult<ImageIndex> {
        let content = fs::read(self.root.join(INDEX_FILE))?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Read and parse a JSON blob (manifest or config).
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::BlobNotFound`] if the blob is absent, or a
    /// serialization error if it does not parse.
    pub fn read_json<T: DeserializeOwned>(&self, digest: &str) -> KilnResult<T> {
        let path = self.blob_path(digest)?;
        let content = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KilnError::BlobNotFound {
                digest: digest.to_string(),
            },
            _ => KilnError::Io(e),
        })?;
        Ok(serde_json::from_slice(&content)?)
    }

    /// Store a blob and return its descriptor.
    ///
    /// # Errors
    ///
    /// Returns an error if the blob cannot be written.
    pub fn write_blob(&self, media_type: &str, data: &[u8]) -> KilnResult<Descriptor> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(data)));
        let path = self.blob_path(&digest)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, data)?;

        Ok(Descriptor::new(media_type, digest, data.len() as u64))
    }

    /// Serialize a value and store it as a blob.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized or written.
    pub fn write_json<T: Serialize>(&self, media_type: &str, value: &T) -> KilnResult<Descriptor> {
        self.write_blob(media_type, &serde_json::to_vec(value)?)
    }

    /// Add a manifest to the index, replacing any manifest with the same tag.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read or written.
    pub fn add_manifest(&self, mut manifest: Descriptor, tag: Option<&str>) -> KilnResult<()> {
        let mut index = self.index()?;

        if let Some(tag) = tag {
            manifest
                .annotations
                .insert(annotations::REF_NAME.to_string(), tag.to_string());
            index
                .manifests
                .retain(|m| m.descriptor.annotation(annotations::REF_NAME) != Some(tag));
        }
        index.manifests.push(ManifestDescriptor {
            descriptor: manifest,
            platform: None,
        });

        fs::write(self.root.join(INDEX_FILE), serde_json::to_vec_pretty(&index)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_requires_marker() {
        let temp = tempfile::tempdir().unwrap();
        assert!(matches!(
            OciLayout::open(temp.path()),
            Err(KilnError::ImageNotFound { .. })
        ));

        fs::write(temp.path().join(LAYOUT_FILE), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        assert!(OciLayout::open(temp.path()).is_ok());
    }

    #[test]
    fn blob_paths_reject_traversal() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join(LAYOUT_FILE), "{}").unwrap();
        let layout = OciLayout::open(temp.path()).unwrap();

        assert_eq!(
            layout.blob_path("sha256:abcd").unwrap(),
            temp.path().join("blobs/sha256/abcd")
        );
        assert!(layout.blob_path("sha256:../../etc").is_err());
    }

    #[test]
    fn written_blobs_are_content_addressed() {
        let temp = tempfile::tempdir().unwrap();
        let layout = OciLayout::init(temp.path()).unwrap();

        let desc = layout.write_blob(media_types::LAYER_TAR, b"layer").unwrap();
        assert_eq!(desc.size, 5);
        assert_eq!(fs::read(layout.blob_path(&desc.digest).unwrap()).unwrap(), b"layer");

        // Writing the same content again gives the same descriptor.
        assert_eq!(layout.write_blob(media_types::LAYER_TAR, b"layer").unwrap(), desc);
    }

    #[test]
    fn tags_are_replaced() {
        let temp = tempfile::tempdir().unwrap();
        let layout = OciLayout::init(temp.path()).unwrap();

        let a = layout.write_json(media_types::MANIFEST, &"a").unwrap();
        let b = layout.write_json(media_types::MANIFEST, &"b").unwrap();
        layout.add_manifest(a, Some("latest")).unwrap();
        layout.add_manifest(b.clone(), Some("latest")).unwrap();

        let index = OciLayout::open(temp.path()).unwrap().index().unwrap();
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.find(Some("latest")).unwrap().descriptor.digest, b.digest);
    }

    #[test]
    fn missing_blob() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join(LAYOUT_FILE), "{}").unwrap();
        let layout = OciLayout::open(temp.path()).unwrap();

        let err = layout
            .read_json::<serde_json::Value>("sha256:00")
            .unwrap_err();
        assert!(matches!(err, KilnError::BlobNotFound { .. }));
    }
}
