//! Base-directory reconciliation.
//!
//! An image may declare a directory that has to exist in a layer's volume
//! even when the layer itself never creates it. Missing segments are copied
//! up from the parent volume, root to leaf, with the parent's mode and
//! ownership. Segments already present in the staging volume are left
//! exactly as they are.

use std::fs::{self, File, FileTimes};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use kiln_common::{KilnError, KilnResult};

use crate::store::is_root;

/// Makes a declared base directory exist in a staging volume.
///
/// Called on a blocking thread.
pub trait BaseDirReconciler: Send + Sync {
    /// Copy `base_dir` (relative to the image root) up from `parent` into
    /// `staging` where missing.
    fn reconcile(&self, staging: &Path, parent: &Path, base_dir: &Path) -> KilnResult<()>;
}

/// Runs the copy-up in the calling process.
///
/// Only correct when the caller already runs with the identity the staging
/// volume is written with.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessReconciler;

impl BaseDirReconciler for InProcessReconciler {
    fn reconcile(&self, staging: &Path, parent: &Path, base_dir: &Path) -> KilnResult<()> {
        copy_up_base_dir(staging, parent, base_dir)
    }
}

/// Copy `base_dir` and its missing ancestors from `parent` into `staging`.
///
/// # Errors
///
/// Returns [`KilnError::BaseDirectory`] if a missing segment does not exist
/// as a directory in the parent, or if a segment leaves either volume.
pub fn copy_up_base_dir(staging: &Path, parent: &Path, base_dir: &Path) -> KilnResult<()> {
    let rel = relative(base_dir)?;
    let parent_root = parent.canonicalize()?;

    tracing::debug!(
        staging = %staging.display(),
        parent = %parent.display(),
        dir = %rel.display(),
        "Reconciling base directory"
    );

    copy_up(staging, &parent_root, &rel, true)
}

fn copy_up(staging: &Path, parent: &Path, rel: &Path, leaf: bool) -> KilnResult<()> {
    let Some(up) = rel.parent() else {
        return Ok(());
    };
    copy_up(staging, parent, up, false)?;

    let target = staging.join(rel);
    match fs::symlink_metadata(&target) {
        Ok(meta) if leaf || meta.is_dir() => return Ok(()),
        Ok(_) => {
            return Err(base_dir_error(rel, "exists in the volume but is not a directory"));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let source = parent.join(rel);
    let meta = match fs::symlink_metadata(&source) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(base_dir_error(rel, "does not exist in the parent volume"));
        }
        Err(e) => return Err(e.into()),
    };
    if !meta.is_dir() || !source.canonicalize()?.starts_with(parent) {
        return Err(base_dir_error(rel, "is not a directory in the parent volume"));
    }

    fs::create_dir(&target)?;
    if is_root() {
        std::os::unix::fs::lchown(&target, Some(meta.uid()), Some(meta.gid()))?;
    }
    fs::set_permissions(&target, fs::Permissions::from_mode(meta.mode() & 0o7777))?;

    if leaf {
        File::open(&target)?.set_times(
            FileTimes::new()
                .set_accessed(meta.accessed()?)
                .set_modified(meta.modified()?),
        )?;
    }

    tracing::trace!(dir = %rel.display(), "Copied up base directory segment");
    Ok(())
}

fn relative(base_dir: &Path) -> KilnResult<PathBuf> {
    let mut rel = PathBuf::new();
    for component in base_dir.components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(base_dir_error(base_dir, "must not contain `..`"));
            }
        }
    }
    Ok(rel)
}

fn base_dir_error(path: &Path, message: &str) -> KilnError {
    KilnError::BaseDirectory {
        path: path.to_path_buf(),
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Volumes {
        _temp: tempfile::TempDir,
        parent: PathBuf,
        staging: PathBuf,
    }

    fn volumes() -> Volumes {
        let temp = tempfile::tempdir().unwrap();
        let parent = temp.path().join("parent");
        let staging = temp.path().join("staging");
        fs::create_dir(&parent).unwrap();
        fs::create_dir(&staging).unwrap();
        Volumes {
            _temp: temp,
            parent,
            staging,
        }
    }

    fn mode(path: &Path) -> u32 {
        fs::metadata(path).unwrap().mode() & 0o7777
    }

    #[test]
    fn copies_missing_chain_with_modes() {
        let v = volumes();
        fs::create_dir_all(v.parent.join("var/lib/app")).unwrap();
        fs::set_permissions(v.parent.join("var/lib"), fs::Permissions::from_mode(0o750)).unwrap();
        fs::set_permissions(v.parent.join("var/lib/app"), fs::Permissions::from_mode(0o711)).unwrap();
        fs::write(v.parent.join("var/lib/app/data"), b"not copied").unwrap();

        copy_up_base_dir(&v.staging, &v.parent, Path::new("/var/lib/app")).unwrap();

        assert_eq!(mode(&v.staging.join("var/lib")), 0o750);
        assert_eq!(mode(&v.staging.join("var/lib/app")), 0o711);
        assert!(!v.staging.join("var/lib/app/data").exists());
        assert_eq!(
            fs::metadata(v.staging.join("var/lib/app")).unwrap().modified().unwrap(),
            fs::metadata(v.parent.join("var/lib/app")).unwrap().modified().unwrap()
        );
    }

    #[test]
    fn existing_segments_are_untouched() {
        let v = volumes();
        fs::create_dir_all(v.parent.join("srv/www")).unwrap();
        fs::set_permissions(v.parent.join("srv"), fs::Permissions::from_mode(0o700)).unwrap();

        fs::create_dir(v.staging.join("srv")).unwrap();
        fs::set_permissions(v.staging.join("srv"), fs::Permissions::from_mode(0o755)).unwrap();
        fs::write(v.staging.join("srv/keep"), b"mine").unwrap();

        copy_up_base_dir(&v.staging, &v.parent, Path::new("srv/www")).unwrap();

        assert_eq!(mode(&v.staging.join("srv")), 0o755);
        assert!(v.staging.join("srv/keep").exists());
        assert!(v.staging.join("srv/www").is_dir());
    }

    #[test]
    fn already_complete_is_a_no_op() {
        let v = volumes();
        fs::create_dir_all(v.staging.join("opt/app")).unwrap();

        // The parent does not have it either; nothing needs copying.
        copy_up_base_dir(&v.staging, &v.parent, Path::new("opt/app")).unwrap();
    }

    #[test]
    fn missing_in_parent_is_fatal() {
        let v = volumes();
        fs::create_dir(v.parent.join("opt")).unwrap();

        let err = copy_up_base_dir(&v.staging, &v.parent, Path::new("opt/missing")).unwrap_err();
        assert!(matches!(err, KilnError::BaseDirectory { .. }));
        // The ancestor that could be copied stays copied.
        assert!(v.staging.join("opt").is_dir());
    }

    #[test]
    fn parent_symlink_escape_is_refused() {
        let v = volumes();
        let outside = tempfile::tempdir().unwrap();
        fs::create_dir(outside.path().join("secret")).unwrap();
        std::os::unix::fs::symlink(outside.path(), v.parent.join("link")).unwrap();

        assert!(copy_up_base_dir(&v.staging, &v.parent, Path::new("link/secret")).is_err());
    }

    #[test]
    fn dotdot_is_rejected() {
        let v = volumes();
        assert!(copy_up_base_dir(&v.staging, &v.parent, Path::new("../etc")).is_err());
    }
}
