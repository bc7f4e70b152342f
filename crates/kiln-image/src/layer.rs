//! Layer descriptors and chain IDs.
//!
//! A layer's chain ID identifies the layer's contents applied on top of all
//! of its ancestors. It is derived from the uncompressed diff IDs the same
//! way the OCI image spec does:
//!
//! ```text
//! ChainID(L0)      = DiffID(L0)
//! ChainID(L0..Ln)  = sha256(ChainID(L0..Ln-1) + " " + DiffID(Ln))
//! ```
//!
//! Two images that share a prefix of layers therefore share the same prefix
//! of chain IDs, which is what lets their volumes be shared on disk.

use std::path::PathBuf;

use kiln_common::{ChainId, IdMapping, KilnResult, VolumeId};
use sha2::{Digest as _, Sha256};

/// One image layer as seen by the materializer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Identifier used to stream the layer bytes from the source.
    pub blob_id: String,
    /// Chain ID of this layer.
    pub chain_id: ChainId,
    /// Chain ID of the layer below, `None` for the base layer.
    pub parent_chain_id: Option<ChainId>,
    /// Declared size in bytes, only used for the quota pre-check.
    pub size: u64,
    /// Directory that must exist in this layer's volume, copied up from
    /// the parent volume when the layer itself does not create it.
    pub base_directory: Option<PathBuf>,
}

impl LayerDescriptor {
    /// Create a descriptor with no base directory.
    #[must_use]
    pub fn new(
        blob_id: impl Into<String>,
        chain_id: ChainId,
        parent_chain_id: Option<ChainId>,
        size: u64,
    ) -> Self {
        Self {
            blob_id: blob_id.into(),
            chain_id,
            parent_chain_id,
            size,
            base_directory: None,
        }
    }

    /// Set the base directory.
    #[must_use]
    pub fn with_base_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_directory = Some(dir.into());
        self
    }
}

/// Compute the chain IDs for a list of diff IDs, base layer first.
///
/// # Errors
///
/// Returns an error if the base diff ID is not a valid chain ID.
pub fn chain_ids(diff_ids: &[String]) -> KilnResult<Vec<ChainId>> {
    let mut chain: Vec<ChainId> = Vec::with_capacity(diff_ids.len());

    for diff_id in diff_ids {
        let next = match chain.last() {
            None => ChainId::new(diff_id.clone())?,
            Some(parent) => {
                let input = format!("sha256:{} {}", parent.as_str(), diff_id);
                ChainId::new(hex::encode(Sha256::digest(input.as_bytes())))?
            }
        };
        chain.push(next);
    }

    Ok(chain)
}

/// Parameters of one materialization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildSpec {
    /// Disk limit in bytes, 0 for unlimited.
    pub disk_limit: u64,
    /// Skip checking the image size against the disk limit.
    pub exclude_base_image_from_quota: bool,
    /// UID mappings applied while unpacking.
    pub uid_mappings: Vec<IdMapping>,
    /// GID mappings applied while unpacking.
    pub gid_mappings: Vec<IdMapping>,
    /// Owner UID forced on created volumes.
    pub owner_uid: u32,
    /// Owner GID forced on created volumes.
    pub owner_gid: u32,
}

impl BuildSpec {
    /// Whether the chain is unpacked through ID mappings.
    #[must_use]
    pub fn is_namespaced(&self) -> bool {
        !self.uid_mappings.is_empty() || !self.gid_mappings.is_empty()
    }

    /// Whether created volumes are chowned.
    #[must_use]
    pub const fn forces_ownership(&self) -> bool {
        self.owner_uid != 0 || self.owner_gid != 0
    }

    /// On-disk identity of a chain's volume under this spec.
    #[must_use]
    pub fn volume_id(&self, chain_id: &ChainId) -> VolumeId {
        VolumeId::for_chain(chain_id, self.is_namespaced())
    }

    /// Sum of declared sizes that counts against the disk limit.
    ///
    /// Returns `None` when no limit applies.
    #[must_use]
    pub fn quota_usage(&self, layers: &[LayerDescriptor]) -> Option<u64> {
        if self.disk_limit == 0 || self.exclude_base_image_from_quota {
            return None;
        }
        Some(layers.iter().map(|l| l.size).fold(0u64, u64::saturating_add))
    }
}
