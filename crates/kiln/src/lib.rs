//! # kiln
//!
//! Command-line front end for the Kiln image volume store.
//!
//! Besides the `pull`, `list` and `sweep` commands, the binary doubles as
//! its own helper: work that needs a user namespace or a chroot is done by
//! re-executing it with an action name in the environment.
//!
//! ```no_run
//! use std::sync::Arc;
//! use kiln::reexec::ActionTable;
//!
//! let actions = Arc::new(ActionTable::builtin());
//! if let Some(code) = actions.dispatch_if_reexec() {
//!     std::process::exit(code);
//! }
//! ```

#![warn(missing_docs)]

pub mod cli;
pub mod reexec;
pub mod userns;
