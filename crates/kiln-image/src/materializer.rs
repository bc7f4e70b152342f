//! Layer-chain materialization.
//!
//! Turns an ordered list of layer descriptors into a chain of published
//! volumes and returns the tip volume's path.
//!
//! The store keeps one invariant everything here relies on: a volume is
//! only published once its parent volume is published. So if the volume of
//! layer `i` exists, so do the volumes of every layer below it, and a single
//! backward scan finds where building has to start. Layers from there on are
//! built one at a time, each under its own chain lock, and each is checked
//! again once the lock is held since another process may have built it
//! while this one waited.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use kiln_common::{KilnError, KilnResult, LayerPhase, VolumeId};

use crate::basedir::{BaseDirReconciler, InProcessReconciler};
use crate::layer::{BuildSpec, LayerDescriptor};
use crate::lock::Locksmith;
use crate::metrics::{self, MetricsEmitter, TracingMetrics};
use crate::source::LayerSource;
use crate::store::{VolumeMeta, VolumeStore};
use crate::unpack::Unpacker;

/// Builds layer chains into volumes.
pub struct Materializer {
    store: Arc<dyn VolumeStore>,
    source: Arc<dyn LayerSource>,
    unpacker: Arc<dyn Unpacker>,
    locksmith: Arc<dyn Locksmith>,
    metrics: Arc<dyn MetricsEmitter>,
    reconciler: Arc<dyn BaseDirReconciler>,
}

impl std::fmt::Debug for Materializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Materializer").finish_non_exhaustive()
    }
}

impl Materializer {
    /// Create a materializer that logs its timings and reconciles base
    /// directories in-process.
    #[must_use]
    pub fn new(
        store: Arc<dyn VolumeStore>,
        source: Arc<dyn LayerSource>,
        unpacker: Arc<dyn Unpacker>,
        locksmith: Arc<dyn Locksmith>,
    ) -> Self {
        Self {
            store,
            source,
            unpacker,
            locksmith,
            metrics: Arc::new(TracingMetrics),
            reconciler: Arc::new(InProcessReconciler),
        }
    }

    /// Use a different metrics sink.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsEmitter>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Use a different base-directory reconciler.
    #[must_use]
    pub fn with_reconciler(mut self, reconciler: Arc<dyn BaseDirReconciler>) -> Self {
        self.reconciler = reconciler;
        self
    }

    /// Fetch the source's descriptors and materialize them.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptors cannot be fetched or any layer
    /// fails to build.
    pub async fn pull(&self, spec: &BuildSpec) -> KilnResult<PathBuf> {
        let layers = self.source.fetch_descriptors().await?;
        self.materialize(&layers, spec).await
    }

    /// Make sure a volume exists for every layer and return the tip's path.
    ///
    /// # Errors
    ///
    /// Returns [`KilnError::EmptyImage`] for an empty list,
    /// [`KilnError::QuotaExceeded`] before touching anything if the declared
    /// sizes exceed the disk limit, and [`KilnError::LayerFailed`] naming the
    /// layer and phase when a build fails. Volumes published before the
    /// failure are kept.
    pub async fn materialize(
        &self,
        layers: &[LayerDescriptor],
        spec: &BuildSpec,
    ) -> KilnResult<PathBuf> {
        if layers.is_empty() {
            return Err(KilnError::EmptyImage);
        }

        if let Some(total) = spec.quota_usage(layers) {
            if total > spec.disk_limit {
                return Err(KilnError::QuotaExceeded {
                    total,
                    limit: spec.disk_limit,
                });
            }
        }

        let (first_missing, mut tip) = self.first_missing(layers, spec)?;
        if first_missing == layers.len() {
            tracing::debug!(layers = layers.len(), "Layer chain already materialized");
        } else {
            tracing::info!(
                layers = layers.len(),
                missing = layers.len() - first_missing,
                namespaced = spec.is_namespaced(),
                "Materializing layer chain"
            );
        }

        for layer in &layers[first_missing..] {
            tip = Some(self.build_layer(layer, tip.as_deref(), spec).await?);
        }

        tip.ok_or(KilnError::EmptyImage)
    }

    /// Index of the first layer without a volume, with the volume path of
    /// the layer below it.
    fn first_missing(
        &self,
        layers: &[LayerDescriptor],
        spec: &BuildSpec,
    ) -> KilnResult<(usize, Option<PathBuf>)> {
        for (i, layer) in layers.iter().enumerate().rev() {
            let existing = self
                .store
                .exists(&spec.volume_id(&layer.chain_id))
                .map_err(|e| fail(layer, LayerPhase::Create, e))?;
            if let Some(path) = existing {
                return Ok((i + 1, Some(path)));
            }
        }
        Ok((0, None))
    }

    async fn build_layer(
        &self,
        layer: &LayerDescriptor,
        parent: Option<&Path>,
        spec: &BuildSpec,
    ) -> KilnResult<PathBuf> {
        let guard = self
            .locksmith
            .lock(layer.chain_id.as_str())
            .await
            .map_err(|e| fail(layer, LayerPhase::Lock, e))?;

        let result = self.build_locked(layer, parent, spec).await;

        if let Err(e) = guard.unlock() {
            tracing::warn!(chain = %layer.chain_id.short(), error = %e, "Failed to release chain lock");
        }
        result
    }

    async fn build_locked(
        &self,
        layer: &LayerDescriptor,
        parent: Option<&Path>,
        spec: &BuildSpec,
    ) -> KilnResult<PathBuf> {
        let volume_id = spec.volume_id(&layer.chain_id);

        let existing = self
            .store
            .exists(&volume_id)
            .map_err(|e| fail(layer, LayerPhase::Create, e))?;
        if let Some(path) = existing {
            tracing::debug!(volume = %volume_id, "Volume was built while waiting for its lock");
            return Ok(path);
        }

        let start = Instant::now();
        let fetched = self.source.stream_layer(&layer.blob_id).await;
        self.metrics
            .record_duration(metrics::DOWNLOAD, &layer.blob_id, start);
        let (stream, _) = fetched.map_err(|e| fail(layer, LayerPhase::Download, e))?;

        let staging = {
            let store = Arc::clone(&self.store);
            let parent = parent.map(Path::to_path_buf);
            let id = volume_id.clone();
            blocking(move || store.create_staging(parent.as_deref(), &id))
                .await
                .map_err(|e| fail(layer, LayerPhase::Create, e))?
        };

        if let Some(base_dir) = &layer.base_directory {
            match parent {
                Some(parent) => {
                    let reconciler = Arc::clone(&self.reconciler);
                    let (staging, parent, base_dir) =
                        (staging.clone(), parent.to_path_buf(), base_dir.clone());
                    if let Err(e) =
                        blocking(move || reconciler.reconcile(&staging, &parent, &base_dir)).await
                    {
                        self.discard(&volume_id).await;
                        return Err(fail(layer, LayerPhase::BaseDirectory, e));
                    }
                }
                None => tracing::debug!(
                    blob = %layer.blob_id,
                    dir = %base_dir.display(),
                    "Base layer declares a base directory, nothing to copy it from"
                ),
            }
        }

        let start = Instant::now();
        let populated = {
            let unpacker = Arc::clone(&self.unpacker);
            let target = staging.clone();
            let (uids, gids) = (spec.uid_mappings.clone(), spec.gid_mappings.clone());
            blocking(move || unpacker.populate(stream, &target, &uids, &gids)).await
        };
        self.metrics
            .record_duration(metrics::UNPACK, &layer.blob_id, start);

        let size = match populated {
            Ok(size) => size,
            Err(e) => {
                self.discard(&volume_id).await;
                return Err(fail(layer, LayerPhase::Unpack, e));
            }
        };

        if spec.forces_ownership() {
            if let Err(e) =
                std::os::unix::fs::chown(&staging, Some(spec.owner_uid), Some(spec.owner_gid))
            {
                self.discard(&volume_id).await;
                return Err(fail(layer, LayerPhase::Ownership, e.into()));
            }
        }

        let path = self
            .store
            .publish(&staging, &volume_id)
            .map_err(|e| fail(layer, LayerPhase::Publish, e))?;

        self.store
            .write_metadata(&layer.chain_id, &VolumeMeta { size })
            .map_err(|e| fail(layer, LayerPhase::Metadata, e))?;

        tracing::info!(
            chain = %layer.chain_id.short(),
            blob = %layer.blob_id,
            size,
            "Layer volume published"
        );

        Ok(path)
    }

    /// Best-effort removal of a staging volume after a failed build.
    async fn discard(&self, volume_id: &VolumeId) {
        let store = Arc::clone(&self.store);
        let id = volume_id.clone();
        if let Err(e) = blocking(move || store.destroy(&id)).await {
            tracing::warn!(volume = %volume_id, error = %e, "Failed to destroy staging volume");
        }
    }
}

fn fail(layer: &LayerDescriptor, phase: LayerPhase, source: KilnError) -> KilnError {
    tracing::error!(
        blob = %layer.blob_id,
        chain = %layer.chain_id.short(),
        %phase,
        error = %source,
        "Layer build failed"
    );
    KilnError::layer(phase, layer.blob_id.clone(), layer.chain_id.to_string(), source)
}

async fn blocking<T, F>(f: F) -> KilnResult<T>
where
    F: FnOnce() -> KilnResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| KilnError::Internal {
            message: format!("blocking task failed: {e}"),
        })?
}
