//! Volume store.
//!
//! Volumes are directories named after the (possibly wrapped) chain ID of
//! the layer they hold. A volume is first built under a staging name and
//! only becomes visible under its final name through an atomic rename, so
//! a lookup by final name never sees a half-populated volume.
//!
//! ```text
//! <root>/volumes/<volume-id>                          published
//! <root>/volumes/<volume-id>-incomplete-<ns>-<pid>     staging
//! <root>/meta/volume-<chain-id>.json                  metadata
//! ```

use std::collections::HashMap;
use std::fs::{self, File, FileTimes};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use kiln_common::paths::INCOMPLETE_MARKER;
use kiln_common::{ChainId, KilnError, KilnPaths, KilnResult, VolumeId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Metadata recorded for a published volume.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMeta {
    /// Bytes written while populating the volume.
    pub size: u64,
}

/// Storage for chain-addressed volumes.
///
/// The store owns the mapping from a volume ID to whatever is on disk for
/// it: [`destroy`](VolumeStore::destroy) removes a staging volume created by
/// this store if one is outstanding, and the published volume otherwise.
pub trait VolumeStore: Send + Sync {
    /// Path of the published volume, if it exists.
    fn exists(&self, id: &VolumeId) -> KilnResult<Option<PathBuf>>;

    /// Create a staging volume for `id`, seeded from `parent` if given.
    fn create_staging(&self, parent: Option<&Path>, id: &VolumeId) -> KilnResult<PathBuf>;

    /// Atomically move a staging volume to its final name.
    fn publish(&self, staging: &Path, id: &VolumeId) -> KilnResult<PathBuf>;

    /// Record metadata for a chain.
    fn write_metadata(&self, chain_id: &ChainId, meta: &VolumeMeta) -> KilnResult<()>;

    /// Remove the staging or published volume for `id`.
    fn destroy(&self, id: &VolumeId) -> KilnResult<()>;
}

/// Directory-backed volume store.
///
/// Child volumes are seeded with a full copy of their parent, so each
/// published volume is a complete root filesystem for its chain.
#[derive(Debug)]
pub struct DirVolumeStore {
    paths: KilnPaths,
    /// Outstanding staging volumes created by this store, per volume.
    staging: Mutex<HashMap<VolumeId, Vec<PathBuf>>>,
}

/// A staging volume found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingVolume {
    /// Volume the staging directory was building.
    pub id: VolumeId,
    /// Staging directory.
    pub path: PathBuf,
}

impl DirVolumeStore {
    /// Open (and create if needed) a store.
    ///
    /// # Errors
    ///
    /// Returns an error if the store directories cannot be created.
    pub fn new(paths: KilnPaths) -> KilnResult<Self> {
        paths.create_dirs()?;

        Ok(Self {
            paths,
            staging: Mutex::new(HashMap::new()),
        })
    }

    /// Get the store paths.
    #[must_use]
    pub const fn paths(&self) -> &KilnPaths {
        &self.paths
    }

    /// Directory every volume lives under.
    #[must_use]
    pub fn volumes_dir(&self) -> PathBuf {
        self.paths.volumes()
    }

    /// List published volumes.
    ///
    /// # Errors
    ///
    /// Returns an error if the volumes directory cannot be read.
    pub fn list(&self) -> KilnResult<Vec<VolumeId>> {
        let mut volumes = Vec::new();

        for entry in fs::read_dir(self.paths.volumes())? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.contains(INCOMPLETE_MARKER) || !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(id) = VolumeId::new(name) {
                volumes.push(id);
            }
        }

        volumes.sort();
        Ok(volumes)
    }

    /// List staging volumes left on disk, by this or any other process.
    ///
    /// # Errors
    ///
    /// Returns an error if the volumes directory cannot be read.
    pub fn list_staging(&self) -> KilnResult<Vec<StagingVolume>> {
        let mut found = Vec::new();

        for entry in fs::read_dir(self.paths.volumes())? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Some(idx) = name.rfind(INCOMPLETE_MARKER) else {
                continue;
            };
            if let Ok(id) = VolumeId::new(&name[..idx]) {
                found.push(StagingVolume {
                    id,
                    path: entry.path(),
                });
            }
        }

        Ok(found)
    }

    /// Remove a staging directory found by [`list_staging`](Self::list_staging).
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not a staging volume of this store
    /// or cannot be removed.
    pub fn remove_staging(&self, staging: &StagingVolume) -> KilnResult<()> {
        let is_staging = staging.path.parent() == Some(self.paths.volumes().as_path())
            && staging
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(INCOMPLETE_MARKER));
        if !is_staging {
            return Err(KilnError::VolumeNotFound {
                id: staging.path.display().to_string(),
            });
        }

        remove_tree(&staging.path)?;
        self.staging.lock().retain(|_, paths| {
            paths.retain(|p| p != &staging.path);
            !paths.is_empty()
        });
        Ok(())
    }

    /// Read the metadata recorded for a chain.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::VolumeNotFound`] if no metadata was written.
    pub fn read_metadata(&self, chain_id: &ChainId) -> KilnResult<VolumeMeta> {
        let path = self.paths.volume_meta(chain_id.as_str());
        let content = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => KilnError::VolumeNotFound {
                id: chain_id.to_string(),
            },
            _ => KilnError::Io(e),
        })?;
        Ok(serde_json::from_slice(&content)?)
    }

    fn staging_path(&self, id: &VolumeId) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        self.paths.volume(&format!(
            "{id}{INCOMPLETE_MARKER}{nanos}-{}",
            std::process::id()
        ))
    }

    fn forget_staging(&self, id: &VolumeId, staging: &Path) {
        let mut map = self.staging.lock();
        if let Some(paths) = map.get_mut(id) {
            paths.retain(|p| p != staging);
            if paths.is_empty() {
                map.remove(id);
            }
        }
    }
}

impl VolumeStore for DirVolumeStore {
    fn exists(&self, id: &VolumeId) -> KilnResult<Option<PathBuf>> {
        let path = self.paths.volume(id.as_str());
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => Ok(Some(path)),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_staging(&self, parent: Option<&Path>, id: &VolumeId) -> KilnResult<PathBuf> {
        let staging = loop {
            let candidate = self.staging_path(id);
            match fs::create_dir(&candidate) {
                Ok(()) => break candidate,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }
        };

        self.staging
            .lock()
            .entry(id.clone())
            .or_default()
            .push(staging.clone());

        if let Some(parent) = parent {
            if let Err(e) = copy_tree(parent, &staging) {
                tracing::warn!(volume = %id, error = %e, "Failed to seed staging volume");
                self.forget_staging(id, &staging);
                if let Err(cleanup) = remove_tree(&staging) {
                    tracing::warn!(
                        volume = %id,
                        path = %staging.display(),
                        error = %cleanup,
                        "Failed to remove staging volume"
                    );
                }
                return Err(e);
            }
        }

        tracing::debug!(
            volume = %id,
            path = %staging.display(),
            parent = ?parent,
            "Staging volume created"
        );

        Ok(staging)
    }

    fn publish(&self, staging: &Path, id: &VolumeId) -> KilnResult<PathBuf> {
        let target = self.paths.volume(id.as_str());

        fs::rename(staging, &target)?;
        self.forget_staging(id, staging);

        tracing::debug!(volume = %id, path = %target.display(), "Volume published");
        Ok(target)
    }

    fn write_metadata(&self, chain_id: &ChainId, meta: &VolumeMeta) -> KilnResult<()> {
        let path = self.paths.volume_meta(chain_id.as_str());
        let tmp = self.paths.tmp().join(format!(
            "volume-{chain_id}.json.{}",
            std::process::id()
        ));

        fs::write(&tmp, serde_json::to_vec(meta)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn destroy(&self, id: &VolumeId) -> KilnResult<()> {
        let outstanding = self.staging.lock().remove(id);
        if let Some(outstanding) = outstanding {
            for staging in &outstanding {
                remove_tree(staging)?;
                tracing::debug!(volume = %id, path = %staging.display(), "Staging volume destroyed");
            }
            return Ok(());
        }

        let Some(path) = self.exists(id)? else {
            return Err(KilnError::VolumeNotFound { id: id.to_string() });
        };

        remove_tree(&path)?;
        if let Ok(chain_id) = id.chain_id() {
            let meta = self.paths.volume_meta(chain_id.as_str());
            if let Err(e) = fs::remove_file(&meta) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(volume = %id, "Volume destroyed");
        Ok(())
    }
}

/// Whether the process may chown files to arbitrary owners.
pub(crate) fn is_root() -> bool {
    rustix::process::geteuid().is_root()
}

/// Copy a volume tree, keeping modes, ownership, symlinks and mtimes.
fn copy_tree(src: &Path, dst: &Path) -> KilnResult<()> {
    let preserve_owner = is_root();
    let mut dirs = Vec::new();

    for entry in walkdir::WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| KilnError::Internal {
            message: format!("Failed to walk {}: {e}", src.display()),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| KilnError::Internal {
                message: e.to_string(),
            })?;
        let target = dst.join(rel);
        let meta = entry.path().symlink_metadata()?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            if !rel.as_os_str().is_empty() {
                fs::create_dir(&target)?;
            }
            dirs.push((target.clone(), meta.clone()));
        } else if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
            set_mtime(&target, &meta)?;
        } else if !preserve_owner
            && (file_type.is_char_device() || file_type.is_block_device())
        {
            tracing::debug!(path = %entry.path().display(), "Skipping device node");
            continue;
        } else {
            rustix::fs::mknodat(
                rustix::fs::CWD,
                &target,
                rustix::fs::FileType::from_raw_mode(meta.mode()),
                rustix::fs::Mode::from_raw_mode(meta.mode()),
                meta.rdev(),
            )
            .map_err(|e| KilnError::PermissionDenied {
                operation: format!("mknod {}: {e}", target.display()),
            })?;
        }

        if preserve_owner {
            std::os::unix::fs::lchown(&target, Some(meta.uid()), Some(meta.gid()))?;
        }
        if !file_type.is_symlink() && !file_type.is_dir() {
            fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode()))?;
        }
    }

    // Directories last, deepest first, so writes into them do not bump
    // their mtime and restrictive modes do not block the copy.
    for (dir, meta) in dirs.iter().rev() {
        fs::set_permissions(dir, fs::Permissions::from_mode(meta.mode()))?;
        set_mtime(dir, meta)?;
    }

    Ok(())
}

fn set_mtime(path: &Path, meta: &fs::Metadata) -> KilnResult<()> {
    let file = File::open(path)?;
    file.set_times(
        FileTimes::new()
            .set_accessed(meta.accessed()?)
            .set_modified(meta.modified()?),
    )?;
    Ok(())
}

/// Remove a volume tree, first making directories writable so read-only
/// image directories do not block removal by an unprivileged owner.
fn remove_tree(path: &Path) -> KilnResult<()> {
    if !is_root() {
        for entry in walkdir::WalkDir::new(path).follow_links(false) {
            let Ok(entry) = entry else { continue };
            if entry.file_type().is_dir() {
                let _ = fs::set_permissions(entry.path(), fs::Permissions::from_mode(0o700));
            }
        }
    }

    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
