//! Shared fixtures for kiln-image integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{self, Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use kiln_common::{ChainId, IdMapping, KilnError, KilnPaths, KilnResult, VolumeId};
use kiln_image::store::StagingVolume;
use kiln_image::{
    DirVolumeStore, FileLocksmith, ImageReference, LayerDescriptor, LayerSource, LayerStream,
    LockGuard, Locksmith, Unpacker, VolumeMeta, VolumeStore,
};
use kiln_oci::image::{ImageConfig, ImageManifest, RootFs, annotations, media_types};
use kiln_oci::OciLayout;
use parking_lot::Mutex;
use sha2::{Digest as _, Sha256};

// ---------------------------------------------------------------------------
// Layer chains

/// A linear chain of `n` descriptors with the given declared sizes.
pub fn chain(sizes: &[u64]) -> Vec<LayerDescriptor> {
    let mut layers: Vec<LayerDescriptor> = Vec::new();
    for (i, size) in sizes.iter().enumerate() {
        let parent = layers.last().map(|l| l.chain_id.clone());
        layers.push(LayerDescriptor::new(
            format!("blob-{i}"),
            ChainId::new(format!("chain-{i}")).unwrap(),
            parent,
            *size,
        ));
    }
    layers
}

// ---------------------------------------------------------------------------
// Store

/// Directory store that counts what the materializer asks of it.
pub struct CountingStore {
    pub inner: DirVolumeStore,
    pub creates: AtomicUsize,
    pub destroys: AtomicUsize,
    pub parents: Mutex<Vec<Option<PathBuf>>>,
    pub fail_destroy: bool,
    pub fail_exists: bool,
}

impl CountingStore {
    pub fn new(root: &Path) -> Self {
        Self {
            inner: DirVolumeStore::new(KilnPaths::with_root(root)).unwrap(),
            creates: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
            parents: Mutex::new(Vec::new()),
            fail_destroy: false,
            fail_exists: false,
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Parent passed to each `create_staging` call, in order.
    pub fn parents(&self) -> Vec<Option<PathBuf>> {
        self.parents.lock().clone()
    }

    pub fn staging(&self) -> Vec<StagingVolume> {
        self.inner.list_staging().unwrap()
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner.exists(&VolumeId::new(id).unwrap()).unwrap().is_some()
    }
}

impl VolumeStore for CountingStore {
    fn exists(&self, id: &VolumeId) -> KilnResult<Option<PathBuf>> {
        if self.fail_exists {
            return Err(KilnError::Internal {
                message: "store unavailable".to_string(),
            });
        }
        self.inner.exists(id)
    }

    fn create_staging(&self, parent: Option<&Path>, id: &VolumeId) -> KilnResult<PathBuf> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.parents.lock().push(parent.map(Path::to_path_buf));
        self.inner.create_staging(parent, id)
    }

    fn publish(&self, staging: &Path, id: &VolumeId) -> KilnResult<PathBuf> {
        self.inner.publish(staging, id)
    }

    fn write_metadata(&self, chain_id: &ChainId, meta: &VolumeMeta) -> KilnResult<()> {
        self.inner.write_metadata(chain_id, meta)
    }

    fn destroy(&self, id: &VolumeId) -> KilnResult<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        if self.fail_destroy {
            return Err(KilnError::Internal {
                message: "destroy refused".to_string(),
            });
        }
        self.inner.destroy(id)
    }
}

// ---------------------------------------------------------------------------
// Source

/// In-memory layer blobs keyed by blob ID.
#[derive(Default)]
pub struct FakeSource {
    pub blobs: HashMap<String, Vec<u8>>,
    pub descriptors: Vec<LayerDescriptor>,
    pub fetches: AtomicUsize,
}

impl FakeSource {
    /// Blob `blob-i` holds `contents[i]`.
    pub fn with_contents(contents: &[&str]) -> Self {
        Self {
            blobs: contents
                .iter()
                .enumerate()
                .map(|(i, c)| (format!("blob-{i}"), c.as_bytes().to_vec()))
                .collect(),
            ..Self::default()
        }
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LayerSource for FakeSource {
    async fn fetch_descriptors(&self) -> KilnResult<Vec<LayerDescriptor>> {
        Ok(self.descriptors.clone())
    }

    async fn stream_layer(&self, blob_id: &str) -> KilnResult<(LayerStream, u64)> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .blobs
            .get(blob_id)
            .cloned()
            .ok_or_else(|| KilnError::BlobNotFound {
                digest: blob_id.to_string(),
            })?;
        let size = data.len() as u64;
        Ok((Box::new(Cursor::new(data)), size))
    }
}

// ---------------------------------------------------------------------------
// Unpacker

/// Writes each blob's bytes to `layer-<n>` in the volume. A blob reading
/// `fail` fails after writing.
#[derive(Default)]
pub struct FakeUnpacker {
    pub populates: AtomicUsize,
    pub delay: Option<Duration>,
    pub mappings: Mutex<Vec<(Vec<IdMapping>, Vec<IdMapping>)>>,
}

impl FakeUnpacker {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn populates(&self) -> usize {
        self.populates.load(Ordering::SeqCst)
    }
}

impl Unpacker for FakeUnpacker {
    fn populate(
        &self,
        mut stream: LayerStream,
        target: &Path,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> KilnResult<u64> {
        let n = self.populates.fetch_add(1, Ordering::SeqCst);
        self.mappings
            .lock()
            .push((uid_mappings.to_vec(), gid_mappings.to_vec()));
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        let mut data = Vec::new();
        io::copy(&mut stream, &mut data)?;
        std::fs::write(target.join(format!("layer-{n}")), &data)?;

        if data == b"fail" {
            return Err(KilnError::Internal {
                message: "bad layer".to_string(),
            });
        }
        Ok(data.len() as u64)
    }
}

// ---------------------------------------------------------------------------
// Locks

/// File locks that count acquisitions.
pub struct CountingLocksmith {
    pub inner: FileLocksmith,
    pub locks: AtomicUsize,
}

impl CountingLocksmith {
    pub fn new(dir: &Path) -> Self {
        Self {
            inner: FileLocksmith::new(dir).unwrap(),
            locks: AtomicUsize::new(0),
        }
    }

    pub fn locks(&self) -> usize {
        self.locks.load(Ordering::SeqCst)
    }

    pub fn is_free(&self, key: &str) -> bool {
        self.inner.try_lock(key).unwrap().is_some()
    }
}

#[async_trait]
impl Locksmith for CountingLocksmith {
    async fn lock(&self, key: &str) -> KilnResult<LockGuard> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        self.inner.lock(key).await
    }

    fn try_lock(&self, key: &str) -> KilnResult<Option<LockGuard>> {
        self.inner.try_lock(key)
    }
}

// ---------------------------------------------------------------------------
// OCI layouts

/// One tar entry.
pub enum Entry<'a> {
    Dir(u32),
    File(&'a [u8], u32),
    Symlink(&'a str),
}

/// Build an uncompressed tar layer.
pub fn tar_layer(entries: &[(&str, Entry<'_>)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, entry) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(1_700_000_000);
        match entry {
            Entry::Dir(mode) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(*mode);
                header.set_size(0);
                header.set_cksum();
                builder.append_data(&mut header, path, io::empty()).unwrap();
            }
            Entry::File(data, mode) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(*mode);
                header.set_size(data.len() as u64);
                header.set_cksum();
                builder.append_data(&mut header, path, *data).unwrap();
            }
            Entry::Symlink(target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder.append_link(&mut header, path, target).unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

/// Writes an image into an OCI layout.
pub struct ImageBuilder {
    layout: OciLayout,
    layers: Vec<kiln_oci::Descriptor>,
    diff_ids: Vec<String>,
}

impl ImageBuilder {
    pub fn new(root: &Path) -> Self {
        Self {
            layout: OciLayout::init(root).unwrap(),
            layers: Vec::new(),
            diff_ids: Vec::new(),
        }
    }

    /// Add a gzip-compressed layer.
    pub fn layer(self, tar: &[u8]) -> Self {
        self.layer_with(tar, None)
    }

    /// Add a gzip-compressed layer declaring a base directory.
    pub fn layer_with(mut self, tar: &[u8], base_dir: Option<&str>) -> Self {
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(tar).unwrap();
        let blob = gz.finish().unwrap();

        let mut desc = self
            .layout
            .write_blob(media_types::LAYER_TAR_GZIP, &blob)
            .unwrap();
        if let Some(dir) = base_dir {
            desc.annotations
                .insert(annotations::BASE_DIRECTORY.to_string(), dir.to_string());
        }

        self.diff_ids
            .push(format!("sha256:{}", hex::encode(Sha256::digest(tar))));
        self.layers.push(desc);
        self
    }

    /// Write config, manifest and index entry.
    pub fn finish(self, tag: &str) -> ImageReference {
        let config = ImageConfig {
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            rootfs: RootFs {
                diff_ids: self.diff_ids,
                ..RootFs::default()
            },
        };
        let config = self
            .layout
            .write_json(media_types::CONFIG, &config)
            .unwrap();

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::MANIFEST.to_string()),
            config,
            layers: self.layers,
            annotations: HashMap::new(),
        };
        let manifest = self
            .layout
            .write_json(media_types::MANIFEST, &manifest)
            .unwrap();
        self.layout.add_manifest(manifest, Some(tag)).unwrap();

        ImageReference {
            path: self.layout.root().to_path_buf(),
            tag: Some(tag.to_string()),
        }
    }
}

