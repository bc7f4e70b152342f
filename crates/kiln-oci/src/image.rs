//! OCI Image Specification types.
//!
//! Based on the OCI Image Specification v1.1.0:
//! <https://github.com/opencontainers/image-spec>

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// OCI Image Manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type of the manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Image configuration descriptor.
    pub config: Descriptor,
    /// Image layers, base first.
    pub layers: Vec<Descriptor>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// OCI Image Index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    /// Schema version (must be 2).
    pub schema_version: u32,
    /// Media type.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Manifest list.
    pub manifests: Vec<ManifestDescriptor>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl ImageIndex {
    /// Find a manifest by its `org.opencontainers.image.ref.name` annotation.
    ///
    /// With no tag, the only manifest is returned, or `None` if the index
    /// is ambiguous.
    #[must_use]
    pub fn find(&self, tag: Option<&str>) -> Option<&ManifestDescriptor> {
        match tag {
            Some(tag) => self
                .manifests
                .iter()
                .find(|m| m.descriptor.annotation(annotations::REF_NAME) == Some(tag)),
            None if self.manifests.len() == 1 => self.manifests.first(),
            None => None,
        }
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Content digest.
    pub digest: String,
    /// Content size in bytes.
    pub size: u64,
    /// Annotations.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl Descriptor {
    /// Create a descriptor without annotations.
    #[must_use]
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            annotations: HashMap::new(),
        }
    }

    /// Look up an annotation value.
    #[must_use]
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Whether this descriptor points at a filesystem layer.
    #[must_use]
    pub fn is_layer(&self) -> bool {
        media_types::LAYERS.contains(&self.media_type.as_str())
    }
}

/// Manifest descriptor with platform information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDescriptor {
    /// Base descriptor.
    #[serde(flatten)]
    pub descriptor: Descriptor,
    /// Platform information.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

/// Platform specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Platform {
    /// Operating system.
    pub os: String,
    /// Architecture.
    pub architecture: String,
    /// Architecture variant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// OCI Image Configuration.
///
/// Only the fields needed to lay the image out on disk are modelled;
/// everything else in the config blob is ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageConfig {
    /// Architecture.
    #[serde(default)]
    pub architecture: String,
    /// Operating system.
    #[serde(default)]
    pub os: String,
    /// Rootfs information.
    pub rootfs: RootFs,
}

/// Root filesystem information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootFs {
    /// Type (must be "layers").
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Layer diff IDs (uncompressed digests).
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: "layers".to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// Well-known annotation keys.
pub mod annotations {
    /// Tag of a manifest inside an image layout index.
    pub const REF_NAME: &str = "org.opencontainers.image.ref.name";
    /// Directory a layer requires to exist, copied forward from its parent.
    pub const BASE_DIRECTORY: &str = "io.kiln.image.base-directory";
}

/// Common media types.
pub mod media_types {
    /// OCI image manifest media type.
    pub const MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    /// OCI image index media type.
    pub const INDEX: &str = "application/vnd.oci.image.index.v1+json";
    /// OCI image config media type.
    pub const CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    /// OCI layer media type (tar+gzip).
    pub const LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
    /// OCI layer media type (tar+zstd).
    pub const LAYER_TAR_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
    /// OCI layer media type (uncompressed tar).
    pub const LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    /// Docker layer media type.
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

    /// Media types that carry filesystem layers.
    pub const LAYERS: &[&str] = &[LAYER_TAR_GZIP, LAYER_TAR_ZSTD, LAYER_TAR, DOCKER_LAYER];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_serialization() {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::MANIFEST.to_string()),
            config: Descriptor::new(media_types::CONFIG, "sha256:abc123", 1024),
            layers: vec![Descriptor::new(
                media_types::LAYER_TAR_GZIP,
                "sha256:layer1",
                10240,
            )],
            annotations: HashMap::new(),
        };

        let json = serde_json::to_string_pretty(&manifest).unwrap();
        assert!(json.contains("schemaVersion"));
        assert!(json.contains("sha256:abc123"));
        assert!(manifest.layers[0].is_layer());
        assert!(!manifest.config.is_layer());
    }

    #[test]
    fn index_lookup_by_tag() {
        let index: ImageIndex = serde_json::from_str(
            r#"{
                "schemaVersion": 2,
                "manifests": [
                    {
                        "mediaType": "application/vnd.oci.image.manifest.v1+json",
                        "digest": "sha256:aa",
                        "size": 10,
                        "annotations": {"org.opencontainers.image.ref.name": "v1"}
                    },
                    {
                        "mediaType": "application/vnd.oci.image.manifest.v1+json",
                        "digest": "sha256:bb",
                        "size": 10,
                        "annotations": {"org.opencontainers.image.ref.name": "v2"}
                    }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(index.find(Some("v2")).unwrap().descriptor.digest, "sha256:bb");
        assert!(index.find(Some("v3")).is_none());
        assert!(index.find(None).is_none());
    }

    #[test]
    fn config_ignores_unknown_fields() {
        let config: ImageConfig = serde_json::from_str(
            r#"{
                "architecture": "amd64",
                "os": "linux",
                "config": {"Env": ["PATH=/bin"]},
                "rootfs": {"type": "layers", "diff_ids": ["sha256:aa", "sha256:bb"]}
            }"#,
        )
        .unwrap();

        assert_eq!(config.rootfs.diff_ids.len(), 2);
        assert_eq!(config.os, "linux");
    }
}
