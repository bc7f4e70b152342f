//! # kiln-common
//!
//! Shared types for the Kiln image volume store.
//!
//! This crate provides the pieces every other Kiln crate agrees on:
//! - Chain, volume and content digest identifiers
//! - UID/GID mapping ranges
//! - Standard store paths and the config file
//! - Byte-size quantity parsing
//! - Common error types

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod id;
pub mod idmap;
pub mod paths;
pub mod resource;

pub use config::KilnConfig;
pub use error::{KilnError, KilnResult, LayerPhase};
pub use id::{ChainId, Digest, VolumeId};
pub use idmap::IdMapping;
pub use paths::KilnPaths;
pub use resource::ByteSize;
