//! # kiln-oci
//!
//! OCI (Open Container Initiative) image specification types for Kiln.
//!
//! This crate provides Rust types for:
//! - OCI Image Specification (index, manifests, configs)
//! - OCI Image Layout directories

#![warn(missing_docs)]

pub mod image;
pub mod layout;

pub use image::{Descriptor, ImageConfig, ImageIndex, ImageManifest};
pub use layout::OciLayout;
