//! # kiln-image
//!
//! Layer-chain materialization for Kiln.
//!
//! This crate provides:
//! - Chain-addressed volumes with staging and atomic publish
//! - Per-chain cross-process build locks
//! - OCI layout layer sources with digest verification
//! - Tar layer unpacking with whiteouts and ID mapping
//! - Base-directory copy-up between volumes
//! - The materializer that ties them together

#![warn(missing_docs)]

pub mod basedir;
pub mod layer;
pub mod lock;
pub mod materializer;
pub mod metrics;
pub mod reference;
pub mod source;
pub mod store;
pub mod unpack;

pub use basedir::{BaseDirReconciler, InProcessReconciler};
pub use layer::{BuildSpec, LayerDescriptor};
pub use lock::{FileLocksmith, LockGuard, Locksmith};
pub use materializer::Materializer;
pub use metrics::{InMemoryMetrics, MetricsEmitter, TracingMetrics};
pub use reference::ImageReference;
pub use source::{LayerSource, LayerStream, OciLayoutSource};
pub use store::{DirVolumeStore, VolumeMeta, VolumeStore};
pub use unpack::{TarUnpacker, Unpacker};
