//! CLI command definitions and handlers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};
use color_eyre::eyre::{Result, WrapErr};
use kiln_common::paths::DEFAULT_CONFIG_PATH;
use kiln_common::{ByteSize, IdMapping, KilnConfig, KilnPaths, KilnResult};
use kiln_image::metrics::{DOWNLOAD, UNPACK};
use kiln_image::{
    BaseDirReconciler, BuildSpec, DirVolumeStore, FileLocksmith, ImageReference,
    InMemoryMetrics, InProcessReconciler, Locksmith, Materializer, OciLayoutSource, TarUnpacker,
};
use serde::Serialize;

use crate::reexec::{ActionTable, Reexecer, ReexecReconciler};

/// Kiln - copy-on-write base image volumes
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Root directory for kiln data
    #[arg(long, global = true, env = "KILN_ROOT")]
    pub store: Option<PathBuf>,

    /// Config file
    #[arg(long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Log output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per event
    Json,
}

/// Kiln commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Materialize an image's layer chain and print the top volume's path
    Pull(PullArgs),

    /// List published volumes
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove staging volumes left behind by interrupted builds
    Sweep,
}

/// Arguments of `kiln pull`.
#[derive(Args, Debug)]
pub struct PullArgs {
    /// Image reference, `[oci:]path[:tag]`
    pub image: ImageReference,

    /// Fail before building anything if the layers exceed this size
    #[arg(long)]
    pub disk_limit: Option<ByteSize>,

    /// Do not check the image size against the disk limit
    #[arg(long)]
    pub exclude_image_from_quota: bool,

    /// UID mapping `container:host:size` (repeatable)
    #[arg(long = "uid-mapping")]
    pub uid_mappings: Vec<IdMapping>,

    /// GID mapping `container:host:size` (repeatable)
    #[arg(long = "gid-mapping")]
    pub gid_mappings: Vec<IdMapping>,

    /// Owner UID of created volumes
    #[arg(long)]
    pub owner_uid: Option<u32>,

    /// Owner GID of created volumes
    #[arg(long)]
    pub owner_gid: Option<u32>,

    /// Print per-layer download and unpack timings to stderr
    #[arg(long)]
    pub timings: bool,
}

impl PullArgs {
    /// Merge flags over config file defaults.
    #[must_use]
    pub fn build_spec(&self, config: &KilnConfig) -> BuildSpec {
        let pick = |flag: &[IdMapping], file: &[IdMapping]| {
            (if flag.is_empty() { file } else { flag }).to_vec()
        };

        BuildSpec {
            disk_limit: self
                .disk_limit
                .or(config.disk_limit)
                .map_or(0, |size| size.as_bytes()),
            exclude_base_image_from_quota: self.exclude_image_from_quota
                || config.exclude_image_from_quota,
            uid_mappings: pick(&self.uid_mappings, &config.uid_mappings),
            gid_mappings: pick(&self.gid_mappings, &config.gid_mappings),
            owner_uid: self.owner_uid.or(config.owner_uid).unwrap_or(0),
            owner_gid: self.owner_gid.or(config.owner_gid).unwrap_or(0),
        }
    }
}

/// One row of `kiln list`.
#[derive(Debug, Serialize)]
struct VolumeRow {
    id: String,
    namespaced: bool,
    size: Option<u64>,
    path: PathBuf,
}

impl Cli {
    /// Load the config file. Only an explicitly named file must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or invalid.
    pub fn load_config(&self) -> KilnResult<KilnConfig> {
        match &self.config {
            Some(path) => KilnConfig::load(path, true),
            None => KilnConfig::load(Path::new(DEFAULT_CONFIG_PATH), false),
        }
    }

    /// Store paths: `--store`, then the config file, then the default.
    #[must_use]
    pub fn paths(&self, config: &KilnConfig) -> KilnPaths {
        self.store
            .clone()
            .or_else(|| config.store.clone())
            .map_or_else(KilnPaths::new, KilnPaths::with_root)
    }

    /// Execute the CLI command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn execute(self, config: KilnConfig, actions: Arc<ActionTable>) -> Result<()> {
        let paths = self.paths(&config);
        tracing::debug!(root = %paths.root.display(), "Using store");

        match self.command {
            Commands::Pull(args) => pull(paths, &config, &args, actions).await,
            Commands::List { json } => list(paths, json),
            Commands::Sweep => sweep(paths),
        }
    }
}

async fn pull(
    paths: KilnPaths,
    config: &KilnConfig,
    args: &PullArgs,
    actions: Arc<ActionTable>,
) -> Result<()> {
    let spec = args.build_spec(config);

    let store = Arc::new(DirVolumeStore::new(paths.clone()).wrap_err("Failed to open store")?);
    let locks = Arc::new(FileLocksmith::new(paths.locks()).wrap_err("Failed to open locks")?);
    let source = Arc::new(
        OciLayoutSource::open(&args.image)
            .wrap_err_with(|| format!("Failed to open image {}", args.image))?,
    );

    let reconciler: Arc<dyn BaseDirReconciler> =
        if crate::userns::is_root() || spec.is_namespaced() {
            Arc::new(ReexecReconciler::new(
                Reexecer::new(actions),
                spec.uid_mappings.clone(),
                spec.gid_mappings.clone(),
            ))
        } else {
            Arc::new(InProcessReconciler)
        };

    let mut materializer = Materializer::new(store, source, Arc::new(TarUnpacker::new()), locks)
        .with_reconciler(reconciler);

    let timings = args.timings.then(|| Arc::new(InMemoryMetrics::new()));
    if let Some(metrics) = &timings {
        materializer = materializer.with_metrics(metrics.clone());
    }

    let tip = materializer
        .pull(&spec)
        .await
        .wrap_err_with(|| format!("Failed to pull {}", args.image))?;

    if let Some(metrics) = timings {
        for sample in metrics.samples() {
            eprintln!(
                "{:<8}\t{}\t{}ms",
                sample.name,
                sample.layer,
                sample.duration.as_millis()
            );
        }
        for name in [DOWNLOAD, UNPACK] {
            eprintln!(
                "{name}: {} layers, {}ms total",
                metrics.count(name),
                metrics.total(name).as_millis()
            );
        }
    }

    println!("{}", tip.display());
    Ok(())
}

fn list(paths: KilnPaths, json: bool) -> Result<()> {
    let store = DirVolumeStore::new(paths).wrap_err("Failed to open store")?;
    let ids = store.list().wrap_err("Failed to list volumes")?;

    let rows: Vec<VolumeRow> = ids
        .into_iter()
        .map(|id| {
            let size = id
                .chain_id()
                .and_then(|chain| store.read_metadata(&chain))
                .map(|meta| meta.size)
                .ok();
            VolumeRow {
                path: store.volumes_dir().join(id.as_str()),
                namespaced: id.is_namespaced(),
                id: id.as_str().to_string(),
                size,
            }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        println!("ID\tNAMESPACED\tSIZE");
        for row in rows {
            let size = row.size.map_or_else(|| "-".to_string(), |s| s.to_string());
            println!("{}\t{}\t{}", row.id, row.namespaced, size);
        }
    }
    Ok(())
}

fn sweep(paths: KilnPaths) -> Result<()> {
    let locks = FileLocksmith::new(paths.locks()).wrap_err("Failed to open locks")?;
    let store = DirVolumeStore::new(paths).wrap_err("Failed to open store")?;

    let mut removed = 0usize;
    for staging in store.list_staging()? {
        let chain = staging.id.chain_id()?;

        // A held lock means the build is still running.
        let Some(guard) = locks.try_lock(chain.as_str())? else {
            tracing::info!(volume = %staging.path.display(), "Build in progress, skipping");
            continue;
        };

        store
            .remove_staging(&staging)
            .wrap_err_with(|| format!("Failed to remove {}", staging.path.display()))?;
        tracing::info!(volume = %staging.path.display(), "Removed staging volume");
        removed += 1;

        guard.unlock()?;
    }

    println!("Removed {removed} staging volumes");
    Ok(())
}
