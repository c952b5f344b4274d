//! Fixtures for unit tests: tar layers and OCI image layouts on disk.

use std::path::Path;

use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

/// One entry of a test layer.
#[derive(Debug, Clone)]
pub enum LayerEntry {
    File(String, Vec<u8>, u32),
    Dir(String, u32),
    Symlink(String, String),
    /// Deletion marker for the given path
    Whiteout(String),
    /// Opaque marker for the given directory
    Opaque(String),
}

impl LayerEntry {
    pub fn file(path: &str, content: &str) -> Self {
        LayerEntry::File(path.to_string(), content.as_bytes().to_vec(), 0o644)
    }

    pub fn dir(path: &str) -> Self {
        LayerEntry::Dir(path.to_string(), 0o755)
    }

    pub fn symlink(path: &str, target: &str) -> Self {
        LayerEntry::Symlink(path.to_string(), target.to_string())
    }

    pub fn whiteout(path: &str) -> Self {
        LayerEntry::Whiteout(path.to_string())
    }

    pub fn opaque(dir: &str) -> Self {
        LayerEntry::Opaque(dir.to_string())
    }
}

/// Build an uncompressed tar stream from entries.
pub fn tar_bytes(entries: &[LayerEntry]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        let mut header = tar::Header::new_gnu();
        header.set_mtime(1_700_000_000);
        match entry {
            LayerEntry::File(path, content, mode) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(content.len() as u64);
                header.set_mode(*mode);
                builder
                    .append_data(&mut header, path, content.as_slice())
                    .unwrap();
            }
            LayerEntry::Dir(path, mode) => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(*mode);
                builder
                    .append_data(&mut header, path, std::io::empty())
                    .unwrap();
            }
            LayerEntry::Symlink(path, target) => {
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_size(0);
                header.set_mode(0o777);
                builder.append_link(&mut header, path, target).unwrap();
            }
            LayerEntry::Whiteout(path) => {
                let marker = match path.rsplit_once('/') {
                    Some((dir, name)) => format!("{}/.wh.{}", dir, name),
                    None => format!(".wh.{}", path),
                };
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                builder
                    .append_data(&mut header, marker, std::io::empty())
                    .unwrap();
            }
            LayerEntry::Opaque(dir) => {
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(0);
                header.set_mode(0o644);
                builder
                    .append_data(&mut header, format!("{}/.wh..wh..opq", dir), std::io::empty())
                    .unwrap();
            }
        }
    }
    builder.into_inner().unwrap()
}

/// Gzip-compress bytes.
pub fn gzip(data: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Builds an OCI image layout with real digests.
pub struct OciLayoutBuilder {
    config: serde_json::Value,
    layers: Vec<(Vec<u8>, String)>,
}

impl OciLayoutBuilder {
    pub fn new() -> Self {
        Self {
            config: serde_json::json!({}),
            layers: Vec::new(),
        }
    }

    /// Set the `config` object of the image configuration.
    pub fn config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Add a gzip-compressed layer.
    pub fn layer(mut self, entries: Vec<LayerEntry>) -> Self {
        self.layers.push((
            gzip(&tar_bytes(&entries)),
            "application/vnd.oci.image.layer.v1.tar+gzip".to_string(),
        ));
        self
    }

    /// Add a layer blob verbatim.
    pub fn raw_layer(mut self, data: Vec<u8>, media_type: &str) -> Self {
        self.layers.push((data, media_type.to_string()));
        self
    }

    /// Write the layout into `dir`, returning the manifest digest.
    pub fn write_to(&self, dir: &Path) -> String {
        let blobs = dir.join("blobs").join("sha256");
        std::fs::create_dir_all(&blobs).unwrap();

        let write_blob = |data: &[u8]| -> String {
            let hex = sha256_hex(data);
            std::fs::write(blobs.join(&hex), data).unwrap();
            format!("sha256:{}", hex)
        };

        let layer_descs: Vec<serde_json::Value> = self
            .layers
            .iter()
            .map(|(data, media_type)| {
                serde_json::json!({
                    "mediaType": media_type,
                    "digest": write_blob(data),
                    "size": data.len(),
                })
            })
            .collect();

        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "config": self.config,
            "rootfs": {"type": "layers", "diff_ids": []},
        }))
        .unwrap();
        let config_digest = write_blob(&config);

        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": config_digest,
                "size": config.len(),
            },
            "layers": layer_descs,
        }))
        .unwrap();
        let manifest_digest = write_blob(&manifest);

        let index = serde_json::json!({
            "schemaVersion": 2,
            "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": manifest_digest,
                "size": manifest.len(),
            }]
        });
        std::fs::write(dir.join("index.json"), serde_json::to_vec(&index).unwrap()).unwrap();
        std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();

        manifest_digest
    }

    /// Write the layout as a tar archive at `path`.
    pub fn write_tar(&self, path: &Path) {
        let staging = tempfile::TempDir::new().unwrap();
        self.write_to(staging.path());

        let file = std::fs::File::create(path).unwrap();
        let mut builder = tar::Builder::new(file);
        builder.append_dir_all(".", staging.path()).unwrap();
        builder.finish().unwrap();
    }
}
