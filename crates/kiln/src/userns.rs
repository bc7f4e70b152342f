//! User namespace ID maps.
//!
//! A re-executed helper that unshares a user namespace starts out with no
//! mappings; its parent writes them through `/proc/<pid>/` before letting
//! the helper continue.

use std::fs;
use std::path::Path;

use kiln_common::idmap::to_proc_map;
use kiln_common::{IdMapping, KilnError, KilnResult};

/// Write UID and GID maps for a process that just unshared its user
/// namespace. Empty mapping lists are left unwritten.
///
/// # Errors
///
/// Returns an error if a map file cannot be written, typically because the
/// caller is not allowed to map the requested host ranges.
pub fn write_id_maps(
    pid: u32,
    uid_mappings: &[IdMapping],
    gid_mappings: &[IdMapping],
) -> KilnResult<()> {
    if !uid_mappings.is_empty() {
        write_map(pid, "uid_map", uid_mappings)?;
        tracing::debug!(pid, "UID mappings applied");
    }

    if !gid_mappings.is_empty() {
        // Unprivileged writers must give up setgroups first. Root may keep it.
        let _ = fs::write(format!("/proc/{pid}/setgroups"), "deny");
        write_map(pid, "gid_map", gid_mappings)?;
        tracing::debug!(pid, "GID mappings applied");
    }

    Ok(())
}

fn write_map(pid: u32, file: &str, mappings: &[IdMapping]) -> KilnResult<()> {
    let path = format!("/proc/{pid}/{file}");
    fs::write(&path, to_proc_map(mappings)).map_err(|e| KilnError::PermissionDenied {
        operation: format!("write {path}: {e}"),
    })
}

/// Check if user namespaces are available.
#[must_use]
pub fn user_ns_available() -> bool {
    Path::new("/proc/self/ns/user").exists()
}

/// Check if running as root.
#[must_use]
pub fn is_root() -> bool {
    rustix::process::geteuid().is_root()
}
