//! Shared fixtures for pipeline integration tests.

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

use a3s_image_core::BuildConfig;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

/// Content of one layer: `(path, Some(content))` adds a file,
/// `(path, None)` deletes it.
pub type Layer<'a> = &'a [(&'a str, Option<&'a str>)];

/// Gzip-compressed tar of a layer.
pub fn layer_blob(entries: Layer<'_>) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, content) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(1_700_000_000);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        let (name, data) = match content {
            Some(data) => (path.to_string(), data.as_bytes()),
            None => match path.rsplit_once('/') {
                Some((dir, file)) => (format!("{}/.wh.{}", dir, file), &b""[..]),
                None => (format!(".wh.{}", path), &b""[..]),
            },
        };
        header.set_size(data.len() as u64);
        builder.append_data(&mut header, name, data).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

/// Write an OCI image layout with the given layers and image config into `dir`.
pub fn write_layout(dir: &Path, layers: &[Layer<'_>], config: serde_json::Value) {
    let blobs = dir.join("blobs/sha256");
    std::fs::create_dir_all(&blobs).unwrap();
    let put = |data: &[u8]| {
        let hex = hex::encode(Sha256::digest(data));
        std::fs::write(blobs.join(&hex), data).unwrap();
        (format!("sha256:{}", hex), data.len())
    };

    let layer_descs: Vec<_> = layers
        .iter()
        .map(|entries| {
            let (digest, size) = put(&layer_blob(entries));
            serde_json::json!({
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest,
                "size": size,
            })
        })
        .collect();

    let config = serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": config,
        "rootfs": {"type": "layers", "diff_ids": []},
    }))
    .unwrap();
    let (config_digest, config_size) = put(&config);

    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config_size,
        },
        "layers": layer_descs,
    }))
    .unwrap();
    let (manifest_digest, manifest_size) = put(&manifest);

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest_size,
        }]
    });
    std::fs::write(dir.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
    std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
}

/// Write an OCI archive tarball at `path`.
pub fn write_archive(path: &Path, layers: &[Layer<'_>], config: serde_json::Value) {
    let layout = tempfile::TempDir::new().unwrap();
    write_layout(layout.path(), layers, config);

    let mut builder = tar::Builder::new(std::fs::File::create(path).unwrap());
    builder.append_dir_all(".", layout.path()).unwrap();
    builder.finish().unwrap();
}

/// Build configuration rooted at `tmp_dir` with clamped timestamps.
pub fn config(tmp_dir: &Path) -> BuildConfig {
    BuildConfig {
        tmp_dir: tmp_dir.to_path_buf(),
        platform_arch: "amd64".to_string(),
        source_date_epoch: Some(1_600_000_000),
        ..Default::default()
    }
}

/// Names of the entries directly under `dir`, sorted.
pub fn entries(dir: &Path) -> Vec<PathBuf> {
    let mut names: Vec<_> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| PathBuf::from(e.unwrap().file_name()))
        .collect();
    names.sort();
    names
}
