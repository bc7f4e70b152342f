#![allow(unsafe_code)]
//! Re-executing the current binary to run an action in a fresh process.
//!
//! Work that must happen with a different identity or root directory than
//! the caller's (writing into a UID-mapped volume, say) runs in a child
//! started from `/proc/self/exe`. The child is told which action to run
//! through an environment variable, optionally unshares a user namespace
//! and chroots, then looks the action up in the same [`ActionTable`] the
//! parent was built with.
//!
//! ```text
//! parent                               child (/proc/self/exe)
//!   spawn ─── unshare(NEWUSER) ───────▶ (blocked on stdin)
//!   write uid_map / gid_map
//!   send sync byte ──────────────────▶ chroot(root), chdir("/")
//!                                      run action(args)
//!   wait, collect output ◀─────────── exit status
//! ```

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use kiln_common::{IdMapping, KilnError, KilnResult};
use kiln_image::BaseDirReconciler;
use kiln_image::basedir::copy_up_base_dir;

/// Environment variable naming the action a re-executed child runs.
pub const ACTION_ENV: &str = "__KILN_REEXEC_ACTION";

/// Environment variable naming the directory the child chroots into.
pub const CHROOT_ENV: &str = "__KILN_REEXEC_CHROOT";

/// Environment variable telling the child to wait for its ID maps.
pub const SYNC_ENV: &str = "__KILN_REEXEC_SYNC";

/// Action copying a base directory between two volumes.
pub const COPY_BASE_DIR: &str = "copy-base-dir";

/// Default helper binary.
const SELF_EXE: &str = "/proc/self/exe";

/// A re-executable action, given the child's arguments.
pub type Action = Box<dyn Fn(&[OsString]) -> KilnResult<()> + Send + Sync>;

/// Named actions a re-executed child may run.
#[derive(Default)]
pub struct ActionTable {
    actions: HashMap<&'static str, Action>,
}

impl std::fmt::Debug for ActionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionTable").field("actions", &names).finish()
    }
}

impl ActionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every action the `kiln` binary ships.
    #[must_use]
    pub fn builtin() -> Self {
        Self::new().register(COPY_BASE_DIR, Box::new(copy_base_dir_action))
    }

    /// Add an action.
    #[must_use]
    pub fn register(mut self, name: &'static str, action: Action) -> Self {
        self.actions.insert(name, action);
        self
    }

    /// Whether an action is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Run a registered action.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Reexec`] for an unknown action, or whatever the
    /// action itself fails with.
    pub fn run(&self, name: &str, args: &[OsString]) -> KilnResult<()> {
        let action = self.actions.get(name).ok_or_else(|| KilnError::Reexec {
            action: name.to_string(),
            message: "unknown action".to_string(),
        })?;
        action(args)
    }

    /// If this process was started as a re-exec child, run its action and
    /// return the exit code. Returns `None` in a normal invocation.
    ///
    /// Call this first thing in `main`, before any runtime is started.
    #[must_use]
    pub fn dispatch_if_reexec(&self) -> Option<i32> {
        let action = std::env::var(ACTION_ENV).ok()?;
        let args: Vec<OsString> = std::env::args_os().skip(1).collect();

        match self.enter_child().and_then(|()| self.run(&action, &args)) {
            Ok(()) => Some(0),
            Err(e) => {
                eprintln!("kiln {action}: {e}");
                Some(1)
            }
        }
    }

    fn enter_child(&self) -> KilnResult<()> {
        if std::env::var_os(SYNC_ENV).is_some() {
            let mut byte = [0u8; 1];
            std::io::stdin().read_exact(&mut byte)?;
        }

        if let Some(root) = std::env::var_os(CHROOT_ENV) {
            rustix::process::chroot(Path::new(&root)).map_err(|e| KilnError::PermissionDenied {
                operation: format!("chroot {}: {e}", Path::new(&root).display()),
            })?;
            std::env::set_current_dir("/")?;
        }

        Ok(())
    }
}

/// How a re-executed child is started.
#[derive(Debug, Clone, Default)]
pub struct ReexecOptions {
    /// Directory the child chroots into before running.
    pub chroot: Option<PathBuf>,
    /// UID mappings for a new user namespace.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings for a new user namespace.
    pub gid_mappings: Vec<IdMapping>,
}

impl ReexecOptions {
    fn namespaced(&self) -> bool {
        !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty()
    }
}

/// Starts re-executed children of the current binary.
#[derive(Debug, Clone)]
pub struct Reexecer {
    exe: PathBuf,
    actions: Arc<ActionTable>,
}

impl Reexecer {
    /// Re-exec `/proc/self/exe`, limited to the actions in `actions`.
    #[must_use]
    pub fn new(actions: Arc<ActionTable>) -> Self {
        Self {
            exe: PathBuf::from(SELF_EXE),
            actions,
        }
    }

    /// Use a different helper binary.
    #[must_use]
    pub fn with_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = exe.into();
        self
    }

    /// Run an action in a child, wait for it and return its combined output.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::Reexec`] with the child's combined output if it
    /// cannot be started or exits unsuccessfully.
    pub fn run(
        &self,
        action: &str,
        args: &[OsString],
        options: &ReexecOptions,
    ) -> KilnResult<String> {
        let reexec_error = |message: String| KilnError::Reexec {
            action: action.to_string(),
            message,
        };

        if !self.actions.contains(action) {
            return Err(reexec_error("unknown action".to_string()));
        }

        let mut command = Command::new(&self.exe);
        command
            .args(args)
            .env(ACTION_ENV, action)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(root) = &options.chroot {
            command.env(CHROOT_ENV, root);
        }

        let namespaced = options.namespaced();
        if namespaced {
            command.env(SYNC_ENV, "1");
            // SAFETY: unshare only touches the calling (forked) process and
            // allocates nothing.
            unsafe {
                command.pre_exec(|| {
                    rustix::thread::unshare_unsafe(rustix::thread::UnshareFlags::NEWUSER)
                        .map_err(std::io::Error::from)
                });
            }
        }

        let mut child = command
            .spawn()
            .map_err(|e| reexec_error(format!("failed to start {}: {e}", self.exe.display())))?;

        tracing::debug!(action, pid = child.id(), namespaced, "Re-executed helper");

        if namespaced {
            let synced = crate::userns::write_id_maps(
                child.id(),
                &options.uid_mappings,
                &options.gid_mappings,
            )
            .and_then(|()| {
                child
                    .stdin
                    .take()
                    .ok_or_else(|| reexec_error("helper stdin unavailable".to_string()))?
                    .write_all(&[0])
                    .map_err(KilnError::from)
            });

            if let Err(e) = synced {
                let _ = child.kill();
                let _ = child.wait();
                return Err(e);
            }
        }
        drop(child.stdin.take());

        let output = child
            .wait_with_output()
            .map_err(|e| reexec_error(format!("failed to wait: {e}")))?;

        let mut combined = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr.trim());
        }

        if !output.status.success() {
            return Err(reexec_error(format!("{combined} ({})", output.status)));
        }

        Ok(combined)
    }
}

/// Reconciles base directories in a re-executed child chrooted at the
/// directory holding both volumes, inside the volumes' user namespace when
/// mappings are given.
#[derive(Debug, Clone)]
pub struct ReexecReconciler {
    reexecer: Reexecer,
    uid_mappings: Vec<IdMapping>,
    gid_mappings: Vec<IdMapping>,
}

impl ReexecReconciler {
    /// Create a reconciler running children with the given mappings.
    #[must_use]
    pub const fn new(
        reexecer: Reexecer,
        uid_mappings: Vec<IdMapping>,
        gid_mappings: Vec<IdMapping>,
    ) -> Self {
        Self {
            reexecer,
            uid_mappings,
            gid_mappings,
        }
    }
}

impl BaseDirReconciler for ReexecReconciler {
    fn reconcile(&self, staging: &Path, parent: &Path, base_dir: &Path) -> KilnResult<()> {
        let root = common_root(staging, parent).ok_or_else(|| KilnError::BaseDirectory {
            path: base_dir.to_path_buf(),
            message: format!(
                "{} and {} share no root",
                staging.display(),
                parent.display()
            ),
        })?;
        let relative = |p: &Path| -> KilnResult<OsString> {
            p.strip_prefix(&root)
                .map(|r| r.as_os_str().to_os_string())
                .map_err(|e| KilnError::Internal {
                    message: e.to_string(),
                })
        };

        let args = [
            base_dir.as_os_str().to_os_string(),
            relative(staging)?,
            relative(parent)?,
        ];
        let options = ReexecOptions {
            chroot: Some(root),
            uid_mappings: self.uid_mappings.clone(),
            gid_mappings: self.gid_mappings.clone(),
        };

        self.reexecer
            .run(COPY_BASE_DIR, &args, &options)
            .map(drop)
            .map_err(|e| KilnError::BaseDirectory {
                path: base_dir.to_path_buf(),
                message: e.to_string(),
            })
    }
}

/// `copy-base-dir <dir> <staging> <parent>`, paths relative to the root.
fn copy_base_dir_action(args: &[OsString]) -> KilnResult<()> {
    let [base_dir, staging, parent] = args else {
        return Err(KilnError::Reexec {
            action: COPY_BASE_DIR.to_string(),
            message: format!("expected 3 arguments, got {}", args.len()),
        });
    };

    let root = std::env::current_dir()?;
    copy_up_base_dir(&root.join(staging), &root.join(parent), Path::new(base_dir))
}

/// Deepest directory containing both paths.
fn common_root(a: &Path, b: &Path) -> Option<PathBuf> {
    let mut root = PathBuf::new();
    for (x, y) in a.components().zip(b.components()) {
        if x != y || matches!(x, Component::ParentDir | Component::CurDir) {
            break;
        }
        root.push(x.as_os_str());
    }

    (root.has_root() || root.components().next().is_some()).then_some(root)
}
