//! Layer sources.
//!
//! A layer source resolves an image to its ordered layer descriptors and
//! streams raw layer blobs on demand. Content verification is the source's
//! job; the materializer trusts whatever stream it is handed.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;

use async_trait::async_trait;
use kiln_common::{KilnError, KilnResult};
use kiln_oci::image::{ImageConfig, ImageManifest, annotations};
use kiln_oci::OciLayout;
use sha2::{Digest as _, Sha256};

use crate::layer::{LayerDescriptor, chain_ids};
use crate::reference::ImageReference;

/// A raw (possibly compressed) layer byte stream.
pub type LayerStream = Box<dyn Read + Send>;

/// Where layer descriptors and blobs come from.
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// Resolve the image to its layers, base layer first.
    async fn fetch_descriptors(&self) -> KilnResult<Vec<LayerDescriptor>>;

    /// Open a stream over a layer blob, with its declared size.
    async fn stream_layer(&self, blob_id: &str) -> KilnResult<(LayerStream, u64)>;
}

/// Layer source backed by an OCI image layout directory.
#[derive(Debug, Clone)]
pub struct OciLayoutSource {
    layout: OciLayout,
    tag: Option<String>,
}

impl OciLayoutSource {
    /// Open the layout a reference points at.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory is not an OCI image layout.
    pub fn open(reference: &ImageReference) -> KilnResult<Self> {
        Ok(Self {
            layout: OciLayout::open(&reference.path)?,
            tag: reference.tag.clone(),
        })
    }

    fn manifest(&self) -> KilnResult<ImageManifest> {
        let index = self.layout.index()?;
        let entry = index
            .find(self.tag.as_deref())
            .ok_or_else(|| KilnError::ImageNotFound {
                reference: match &self.tag {
                    Some(tag) => format!("{}:{tag}", self.layout.root().display()),
                    None => self.layout.root().display().to_string(),
                },
            })?;

        self.layout.read_json(&entry.descriptor.digest)
    }

    fn descriptors(&self) -> KilnResult<Vec<LayerDescriptor>> {
        let manifest = self.manifest()?;
        let config: ImageConfig = self.layout.read_json(&manifest.config.digest)?;

        let layers: Vec<_> = manifest.layers.iter().filter(|l| l.is_layer()).collect();
        if layers.len() != config.rootfs.diff_ids.len() {
            return Err(KilnError::Config {
                message: format!(
                    "manifest lists {} layers but config has {} diff IDs",
                    layers.len(),
                    config.rootfs.diff_ids.len()
                ),
            });
        }

        let chain = chain_ids(&config.rootfs.diff_ids)?;
        let descriptors = layers
            .iter()
            .zip(&chain)
            .enumerate()
            .map(|(i, (layer, chain_id))| LayerDescriptor {
                blob_id: layer.digest.clone(),
                chain_id: chain_id.clone(),
                parent_chain_id: i.checked_sub(1).map(|p| chain[p].clone()),
                size: layer.size,
                base_directory: layer
                    .annotation(annotations::BASE_DIRECTORY)
                    .map(PathBuf::from),
            })
            .collect();

        Ok(descriptors)
    }

    fn open_blob(&self, blob_id: &str) -> KilnResult<(LayerStream, u64)> {
        let path = self.layout.blob_path(blob_id)?;
        let file = File::open(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => KilnError::BlobNotFound {
                digest: blob_id.to_string(),
            },
            _ => KilnError::Io(e),
        })?;
        let size = file.metadata()?.len();

        tracing::debug!(blob = blob_id, size, "Opened layer blob");

        let stream = VerifyingReader::new(BufReader::new(file), blob_id)?;
        Ok((Box::new(stream), size))
    }
}

#[async_trait]
impl LayerSource for OciLayoutSource {
    async fn fetch_descriptors(&self) -> KilnResult<Vec<LayerDescriptor>> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.descriptors())
            .await
            .map_err(|e| KilnError::Internal {
                message: format!("descriptor task failed: {e}"),
            })?
    }

    async fn stream_layer(&self, blob_id: &str) -> KilnResult<(LayerStream, u64)> {
        self.open_blob(blob_id)
    }
}

/// Reader that hashes what passes through and fails at EOF on mismatch.
pub struct VerifyingReader<R> {
    inner: R,
    hasher: Sha256,
    expected: String,
    verified: bool,
}

impl<R: Read> VerifyingReader<R> {
    /// Wrap a reader expected to hash to `digest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the digest is not a sha256 digest.
    pub fn new(inner: R, digest: &str) -> KilnResult<Self> {
        let digest: kiln_common::Digest = digest.parse()?;
        if digest.algorithm != "sha256" {
            return Err(KilnError::InvalidId {
                id: digest.to_string(),
            });
        }

        Ok(Self {
            inner,
            hasher: Sha256::new(),
            expected: digest.hash.to_ascii_lowercase(),
            verified: false,
        })
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;

        if n > 0 {
            self.hasher.update(&buf[..n]);
        } else if !buf.is_empty() && !self.verified {
            let actual = hex::encode(self.hasher.finalize_reset());
            if actual != self.expected {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    KilnError::DigestMismatch {
                        digest: format!("sha256:{}", self.expected),
                        actual: format!("sha256:{actual}"),
                    },
                ));
            }
            self.verified = true;
        }

        Ok(n)
    }
}
