//! Layer unpacking.
//!
//! A layer is a (possibly compressed) tar stream applied on top of a
//! staging volume that already holds the parent chain. Entries named
//! `.wh.<name>` delete `<name>` from the lower layers and `.wh..wh..opq`
//! empties its directory of everything the lower layers put there.

use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use kiln_common::idmap::map_to_host;
use kiln_common::{IdMapping, KilnError, KilnResult};

use crate::source::LayerStream;
use crate::store::is_root;

/// Prefix of whiteout entries.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Name of the opaque directory marker.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Populates a staging volume from a layer stream.
///
/// Called on a blocking thread.
pub trait Unpacker: Send + Sync {
    /// Apply the layer in `stream` to `target`, mapping file owners through
    /// the given ranges. Returns the number of content bytes written.
    fn populate(
        &self,
        stream: LayerStream,
        target: &Path,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> KilnResult<u64>;
}

/// Layer compression, sniffed from the stream's magic bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Plain tar.
    None,
    /// gzip.
    Gzip,
    /// zstd.
    Zstd,
}

impl Compression {
    /// Detect the compression of a stream from its first bytes.
    #[must_use]
    pub fn detect(head: &[u8]) -> Self {
        if head.starts_with(&[0x1f, 0x8b]) {
            Self::Gzip
        } else if head.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
            Self::Zstd
        } else {
            Self::None
        }
    }
}

/// Unpacks OCI tar layers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarUnpacker;

impl TarUnpacker {
    /// Create a tar unpacker.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn apply<R: Read>(
        archive: &mut tar::Archive<R>,
        target: &Path,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> KilnResult<u64> {
        let root = is_root();
        let canonical_target = target.canonicalize()?;
        let mut written = 0u64;
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for entry in archive.entries().map_err(into_kiln)? {
            let mut entry = entry.map_err(into_kiln)?;
            let rel = sanitize(&entry.path().map_err(into_kiln)?)?;
            if rel.as_os_str().is_empty() {
                continue;
            }

            let name = rel
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            let parent_rel = rel.parent().unwrap_or(Path::new("")).to_path_buf();

            if name == OPAQUE_WHITEOUT {
                let Some(dir) = resolve_parent(&canonical_target, &parent_rel)? else {
                    continue;
                };
                clear_lower(&dir, &parent_rel, &seen)?;
                continue;
            }

            if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
                let Some(dir) = resolve_parent(&canonical_target, &parent_rel)? else {
                    continue;
                };
                remove_any(&dir.join(hidden))?;
                continue;
            }

            let header = entry.header().clone();
            let entry_type = header.entry_type();

            if !root && (entry_type.is_character_special() || entry_type.is_block_special()) {
                tracing::debug!(path = %rel.display(), "Skipping device node");
                continue;
            }

            let dest = target.join(&rel);
            if let Some(dir) = resolve_parent(&canonical_target, &parent_rel)? {
                let resolved = dir.join(&name);
                if let Ok(existing) = fs::symlink_metadata(&resolved) {
                    if !(existing.is_dir() && entry_type.is_dir()) {
                        remove_any(&resolved)?;
                    }
                }
            }

            entry.set_preserve_permissions(true);
            entry.set_preserve_mtime(true);
            entry.set_unpack_xattrs(root);

            if !entry.unpack_in(target).map_err(into_kiln)? {
                tracing::warn!(path = %rel.display(), "Skipped entry outside the volume");
                continue;
            }

            if root {
                let uid = map_to_host(uid_mappings, id_from_header(header.uid())?);
                let gid = map_to_host(gid_mappings, id_from_header(header.gid())?);
                std::os::unix::fs::lchown(&dest, Some(uid), Some(gid))?;

                // chown clears setuid and setgid bits.
                if !entry_type.is_symlink() {
                    let mode = header.mode().map_err(into_kiln)?;
                    fs::set_permissions(&dest, fs::Permissions::from_mode(mode & 0o7777))?;
                }
            }

            if entry_type.is_file() {
                written = written.saturating_add(header.size().map_err(into_kiln)?);
            }
            seen.insert(rel);
        }

        Ok(written)
    }
}

impl Unpacker for TarUnpacker {
    fn populate(
        &self,
        stream: LayerStream,
        target: &Path,
        uid_mappings: &[IdMapping],
        gid_mappings: &[IdMapping],
    ) -> KilnResult<u64> {
        let mut raw = BufReader::new(stream);
        let compression = Compression::detect(raw.fill_buf().map_err(into_kiln)?);
        tracing::debug!(volume = %target.display(), ?compression, "Unpacking layer");

        let written = {
            let decoder: Box<dyn Read + '_> = match compression {
                Compression::Gzip => Box::new(flate2::read::GzDecoder::new(&mut raw)),
                Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(&mut raw)?),
                Compression::None => Box::new(&mut raw),
            };

            let mut archive = tar::Archive::new(decoder);
            let written = Self::apply(&mut archive, target, uid_mappings, gid_mappings)?;
            io::copy(&mut archive.into_inner(), &mut io::sink()).map_err(into_kiln)?;
            written
        };

        // Drain trailing bytes so the source sees the whole blob.
        io::copy(&mut raw, &mut io::sink()).map_err(into_kiln)?;

        Ok(written)
    }
}

/// Turn an I/O error into a Kiln error, recovering a digest mismatch raised
/// by the source stream however deeply the decoders wrapped it.
fn into_kiln(err: io::Error) -> KilnError {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(e) = current {
        if let Some(KilnError::DigestMismatch { digest, actual }) = e.downcast_ref::<KilnError>() {
            return KilnError::DigestMismatch {
                digest: digest.clone(),
                actual: actual.clone(),
            };
        }
        current = match e.downcast_ref::<io::Error>() {
            Some(io_err) => io_err
                .get_ref()
                .map(|inner| inner as &(dyn std::error::Error + 'static)),
            None => e.source(),
        };
    }
    KilnError::Io(err)
}

fn id_from_header(id: io::Result<u64>) -> KilnResult<u32> {
    let id = id.map_err(into_kiln)?;
    u32::try_from(id).map_err(|_| KilnError::InvalidIdMapping {
        value: id.to_string(),
    })
}

/// Strip root and `.` components, rejecting `..`.
fn sanitize(path: &Path) -> KilnResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(KilnError::PermissionDenied {
                    operation: format!("unpack {}", path.display()),
                });
            }
        }
    }
    Ok(clean)
}

/// Resolve the directory an entry lands in, refusing anything that leaves
/// the volume through a symlink. `None` if the directory does not exist.
fn resolve_parent(canonical_target: &Path, parent_rel: &Path) -> KilnResult<Option<PathBuf>> {
    let dir = match canonical_target.join(parent_rel).canonicalize() {
        Ok(dir) => dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if !dir.starts_with(canonical_target) {
        return Err(KilnError::PermissionDenied {
            operation: format!("unpack into {}", parent_rel.display()),
        });
    }
    Ok(Some(dir))
}

/// Remove every child of `dir` not unpacked by the current layer.
fn clear_lower(dir: &Path, dir_rel: &Path, seen: &HashSet<PathBuf>) -> KilnResult<()> {
    for child in fs::read_dir(dir)? {
        let child = child?;
        if !seen.contains(&dir_rel.join(child.file_name())) {
            remove_any(&child.path())?;
        }
    }
    Ok(())
}

fn remove_any(path: &Path) -> KilnResult<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
