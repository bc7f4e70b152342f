//! Integration tests for the kiln binary.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use kiln_image::{FileLocksmith, Locksmith};
use kiln_oci::image::{ImageConfig, ImageManifest, RootFs, annotations, media_types};
use kiln_oci::OciLayout;
use predicates::prelude::*;
use sha2::{Digest as _, Sha256};

struct Env {
    _temp: tempfile::TempDir,
    store: PathBuf,
    config: PathBuf,
    image: PathBuf,
}

impl Env {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let config = temp.path().join("config.toml");
        fs::write(&config, "").unwrap();

        Self {
            store: temp.path().join("store"),
            image: temp.path().join("image"),
            config,
            _temp: temp,
        }
    }

    fn kiln(&self) -> Command {
        let mut cmd = Command::cargo_bin("kiln").unwrap();
        cmd.env_remove("KILN_ROOT")
            .env_remove("RUST_LOG")
            .arg("--store")
            .arg(&self.store)
            .arg("--config")
            .arg(&self.config);
        cmd
    }

    fn image_ref(&self) -> String {
        format!("{}:latest", self.image.display())
    }

    fn pull(&self) -> PathBuf {
        let out = self
            .kiln()
            .args(["pull", &self.image_ref()])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        PathBuf::from(String::from_utf8(out).unwrap().trim())
    }
}

fn tar_file(path: &str, data: &[u8]) -> (String, Vec<u8>) {
    (path.to_string(), data.to_vec())
}

/// Write an image whose layers each hold the given files.
fn write_image(root: &Path, layers: &[(&[(String, Vec<u8>)], Option<&str>)]) {
    let layout = OciLayout::init(root).unwrap();
    let mut descriptors = Vec::new();
    let mut diff_ids = Vec::new();

    for (files, base_dir) in layers {
        let mut builder = tar::Builder::new(Vec::new());
        for (path, data) in *files {
            let mut header = tar::Header::new_gnu();
            header.set_mode(0o644);
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder.append_data(&mut header, path, data.as_slice()).unwrap();
        }
        let tar = builder.into_inner().unwrap();
        diff_ids.push(format!("sha256:{}", hex::encode(Sha256::digest(&tar))));

        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
        gz.write_all(&tar).unwrap();
        let mut desc = layout
            .write_blob(media_types::LAYER_TAR_GZIP, &gz.finish().unwrap())
            .unwrap();
        if let Some(dir) = base_dir {
            desc.annotations
                .insert(annotations::BASE_DIRECTORY.to_string(), (*dir).to_string());
        }
        descriptors.push(desc);
    }

    let config = layout
        .write_json(
            media_types::CONFIG,
            &ImageConfig {
                architecture: "amd64".to_string(),
                os: "linux".to_string(),
                rootfs: RootFs {
                    diff_ids,
                    ..RootFs::default()
                },
            },
        )
        .unwrap();
    let manifest = layout
        .write_json(
            media_types::MANIFEST,
            &ImageManifest {
                schema_version: 2,
                media_type: Some(media_types::MANIFEST.to_string()),
                config,
                layers: descriptors,
                annotations: HashMap::new(),
            },
        )
        .unwrap();
    layout.add_manifest(manifest, Some("latest")).unwrap();
}

fn two_layer_image(root: &Path) {
    write_image(
        root,
        &[
            (&[tar_file("hello", b"hello")], None),
            (&[tar_file("world", b"world!")], None),
        ],
    );
}

#[test]
fn test_help_lists_commands() {
    Command::cargo_bin("kiln")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("pull"))
        .stdout(predicate::str::contains("sweep"));
}

#[test]
fn test_pull_prints_tip_volume() {
    let env = Env::new();
    two_layer_image(&env.image);

    let tip = env.pull();

    assert!(tip.starts_with(env.store.join("volumes")));
    assert_eq!(fs::read(tip.join("hello")).unwrap(), b"hello");
    assert_eq!(fs::read(tip.join("world")).unwrap(), b"world!");

    // Second pull reuses the chain.
    assert_eq!(env.pull(), tip);
    assert_eq!(fs::read_dir(env.store.join("volumes")).unwrap().count(), 2);
}

#[test]
fn test_list_reports_sizes() {
    let env = Env::new();
    two_layer_image(&env.image);
    env.pull();

    let out = env
        .kiln()
        .args(["list", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let rows: Vec<serde_json::Value> = serde_json::from_slice(&out).unwrap();

    assert_eq!(rows.len(), 2);
    let mut sizes: Vec<u64> = rows.iter().map(|r| r["size"].as_u64().unwrap()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![5, 6]);
    assert!(rows.iter().all(|r| r["namespaced"] == false));
}

#[test]
fn test_timings_summary() {
    let env = Env::new();
    two_layer_image(&env.image);

    env.kiln()
        .args(["pull", &env.image_ref(), "--timings"])
        .assert()
        .success()
        .stderr(predicate::str::contains("download: 2 layers"))
        .stderr(predicate::str::contains("unpack: 2 layers"));
}

#[test]
fn test_disk_limit_rejects_image() {
    let env = Env::new();
    two_layer_image(&env.image);

    env.kiln()
        .args(["pull", &env.image_ref(), "--disk-limit", "10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disk limit"));

    let volumes = env.store.join("volumes");
    assert!(!volumes.exists() || fs::read_dir(volumes).unwrap().count() == 0);
}

#[test]
fn test_config_file_disk_limit() {
    let env = Env::new();
    two_layer_image(&env.image);
    fs::write(&env.config, "disk_limit = \"10\"\n").unwrap();

    env.kiln()
        .args(["pull", &env.image_ref()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("disk limit"));

    env.kiln()
        .args(["pull", &env.image_ref(), "--exclude-image-from-quota"])
        .assert()
        .success();
}

#[test]
fn test_invalid_config_is_reported() {
    let env = Env::new();
    fs::write(&env.config, "unknown_key = 1\n").unwrap();

    env.kiln()
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn test_bad_mapping_is_rejected() {
    let env = Env::new();

    env.kiln()
        .args(["pull", "/nonexistent", "--uid-mapping", "0:1000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid ID mapping"));
}

#[test]
fn test_missing_image_fails() {
    let env = Env::new();

    env.kiln()
        .args(["pull", &env.image_ref()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open image"));
}

#[test]
fn test_sweep_skips_live_builds() {
    let env = Env::new();
    two_layer_image(&env.image);
    env.pull();

    let volumes = env.store.join("volumes");
    fs::create_dir_all(volumes.join("abc-incomplete-1-2/etc")).unwrap();
    fs::create_dir_all(volumes.join("def-incomplete-3-4")).unwrap();

    let locks = FileLocksmith::new(env.store.join("locks")).unwrap();
    let held = locks.try_lock("def").unwrap().unwrap();

    env.kiln()
        .arg("sweep")
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 1 staging volumes"));

    assert!(!volumes.join("abc-incomplete-1-2").exists());
    assert!(volumes.join("def-incomplete-3-4").exists());
    assert_eq!(fs::read_dir(&volumes).unwrap().count(), 3);

    held.unlock().unwrap();
}

#[test]
fn test_base_directory_copied_by_helper() {
    // The helper chroots, which needs root.
    if !rustix::process::geteuid().is_root() {
        return;
    }

    let env = Env::new();
    write_image(
        &env.image,
        &[
            (&[tar_file("srv/www/old", b"old")], None),
            (&[tar_file("index.html", b"<html>")], Some("/srv/www")),
        ],
    );

    let tip = env.pull();

    assert!(tip.join("srv/www").is_dir());
    assert!(tip.join("srv/www/old").is_file());
    assert!(tip.join("index.html").is_file());
}
