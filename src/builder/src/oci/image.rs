//! OCI image layout parsing.
//!
//! Loads an OCI image layout (`oci-layout`, `index.json`, `blobs/`) into
//! the manifest, the translated image configuration and the ordered list
//! of layer blobs.

use a3s_image_core::error::{BuildError, Result};
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest, MediaType};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Maximum depth of nested image indexes followed when resolving a manifest.
const MAX_INDEX_DEPTH: usize = 2;

/// A layer blob referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerBlob {
    /// Digest from the manifest (`sha256:...`)
    pub digest: String,
    /// Media type from the manifest
    pub media_type: String,
    /// Path of the blob inside the layout
    pub path: PathBuf,
}

/// Represents an OCI image loaded from disk.
#[derive(Debug)]
pub struct OciImage {
    /// Root directory of the OCI image layout
    root_dir: PathBuf,

    /// Digest of the resolved manifest
    manifest_digest: String,

    /// Image configuration
    config: OciImageConfig,

    /// Layer blobs (in order, bottom to top)
    layers: Vec<LayerBlob>,
}

/// Parsed OCI image configuration.
#[derive(Debug, Clone, Default)]
pub struct OciImageConfig {
    /// Entrypoint command
    pub entrypoint: Option<Vec<String>>,

    /// Default command arguments
    pub cmd: Option<Vec<String>>,

    /// Environment variables, in declaration order
    pub env: Vec<(String, String)>,

    /// Working directory
    pub working_dir: Option<String>,

    /// User to run as
    pub user: Option<String>,

    /// Exposed ports
    pub exposed_ports: Vec<String>,

    /// Volumes
    pub volumes: Vec<String>,

    /// Stop signal
    pub stop_signal: Option<String>,

    /// Labels
    pub labels: HashMap<String, String>,
}

impl OciImage {
    /// Load an OCI image from a layout directory.
    ///
    /// When the index lists several manifests, the one matching
    /// `platform` (`(os, arch)`) is picked; otherwise the first.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending file if:
    /// - the layout markers are missing
    /// - the index, manifest or config cannot be read or parsed
    pub fn from_path(path: impl AsRef<Path>, platform: Option<(&str, &str)>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();

        Self::validate_oci_layout(&root_dir)?;

        let index_path = root_dir.join("index.json");
        let index: ImageIndex = read_json(&index_path)?;
        let manifest_desc = Self::resolve_manifest(&root_dir, &index, platform, 0)?;
        let manifest_digest = manifest_desc.digest().to_string();

        let manifest: ImageManifest = read_json(&Self::blob_path(&root_dir, &manifest_digest)?)?;

        let config_digest = manifest.config().digest().to_string();
        let oci_config = read_image_config(&Self::blob_path(&root_dir, &config_digest)?)?;
        let config = OciImageConfig::from_oci_config(&oci_config);

        let layers = manifest
            .layers()
            .iter()
            .map(|layer| -> Result<LayerBlob> {
                Ok(LayerBlob {
                    digest: layer.digest().to_string(),
                    media_type: layer.media_type().to_string(),
                    path: Self::blob_path(&root_dir, layer.digest())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            root_dir,
            manifest_digest,
            config,
            layers,
        })
    }

    /// Get the image configuration.
    pub fn config(&self) -> &OciImageConfig {
        &self.config
    }

    /// Get the layer blobs (in order, bottom to top).
    pub fn layers(&self) -> &[LayerBlob] {
        &self.layers
    }

    /// Get the digest of the resolved manifest.
    pub fn manifest_digest(&self) -> &str {
        &self.manifest_digest
    }

    /// Get the root directory of the OCI layout.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Validate that the directory contains a valid OCI layout.
    pub(crate) fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for marker in ["oci-layout", "index.json", "blobs"] {
            let path = root_dir.join(marker);
            if !path.exists() {
                return Err(BuildError::validation(
                    path.display().to_string(),
                    format!("not a valid OCI layout: missing {}", marker),
                ));
            }
        }
        Ok(())
    }

    /// Pick the manifest descriptor for the platform, following nested indexes.
    fn resolve_manifest(
        root_dir: &Path,
        index: &ImageIndex,
        platform: Option<(&str, &str)>,
        depth: usize,
    ) -> Result<Descriptor> {
        let index_path = root_dir.join("index.json").display().to_string();
        let manifests = index.manifests();
        if manifests.is_empty() {
            return Err(BuildError::validation(index_path, "no manifests in image index"));
        }

        // Entries without a platform are accepted only when nothing in the
        // index declares one; a declared mismatch is never packed.
        let chosen = match platform {
            Some(p) => manifests
                .iter()
                .find(|d| descriptor_matches(d, p))
                .or_else(|| {
                    manifests
                        .iter()
                        .all(|d| d.platform().is_none())
                        .then(|| &manifests[0])
                })
                .ok_or_else(|| {
                    BuildError::validation(
                        index_path,
                        format!("no manifest for platform {}/{}", p.0, p.1),
                    )
                })?,
            None => &manifests[0],
        };

        if *chosen.media_type() == MediaType::ImageIndex {
            if depth >= MAX_INDEX_DEPTH {
                return Err(BuildError::validation(
                    chosen.digest().to_string(),
                    "image indexes nested too deeply",
                ));
            }
            let nested: ImageIndex = read_json(&Self::blob_path(root_dir, chosen.digest())?)?;
            return Self::resolve_manifest(root_dir, &nested, platform, depth + 1);
        }

        Ok(chosen.clone())
    }

    /// Get the path to a blob by digest.
    ///
    /// Only well-formed sha256 digests are accepted.
    pub fn blob_path(root_dir: &Path, digest: &str) -> Result<PathBuf> {
        let hex = crate::digest::sha256_hex(digest)?;
        Ok(root_dir.join("blobs").join("sha256").join(hex))
    }
}

/// Whether a descriptor's platform matches `(os, arch)`.
fn descriptor_matches(desc: &Descriptor, (os, arch): (&str, &str)) -> bool {
    desc.platform().as_ref().map_or(false, |p| {
        json_str(p.os()).as_deref() == Some(os) && json_str(p.architecture()).as_deref() == Some(arch)
    })
}

/// Serialized string form of an oci-spec enum.
fn json_str<T: serde::Serialize>(value: &T) -> Option<String> {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Read an image configuration.
///
/// `history` is optional in image configs but required by oci-spec, so a
/// missing or null one is read as empty.
fn read_image_config(path: &Path) -> Result<ImageConfiguration> {
    let mut value: serde_json::Value = read_json(path)?;
    if let Some(object) = value.as_object_mut() {
        let history = object.entry("history").or_insert(serde_json::Value::Null);
        if history.is_null() {
            *history = serde_json::Value::Array(Vec::new());
        }
    }
    serde_json::from_value(value).map_err(|e| {
        BuildError::validation(path.display().to_string(), format!("failed to parse: {}", e))
    })
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read(path).map_err(|e| {
        BuildError::validation(path.display().to_string(), format!("failed to read: {}", e))
    })?;
    serde_json::from_slice(&content).map_err(|e| {
        BuildError::validation(path.display().to_string(), format!("failed to parse: {}", e))
    })
}

impl OciImageConfig {
    /// Create from OCI spec ImageConfiguration.
    fn from_oci_config(oci_config: &ImageConfiguration) -> Self {
        let Some(config) = oci_config.config() else {
            return Self::default();
        };

        let env = config
            .env()
            .as_ref()
            .map(|env_list| {
                env_list
                    .iter()
                    .filter_map(|e| e.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            entrypoint: config.entrypoint().clone(),
            cmd: config.cmd().clone(),
            env,
            working_dir: config.working_dir().clone().filter(|w| !w.is_empty()),
            user: config.user().clone().filter(|u| !u.is_empty()),
            exposed_ports: config.exposed_ports().clone().unwrap_or_default(),
            volumes: config.volumes().clone().unwrap_or_default(),
            stop_signal: config.stop_signal().clone(),
            labels: config.labels().clone().unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{LayerEntry, OciLayoutBuilder};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_validate_oci_layout_missing_markers() {
        let tmp = TempDir::new().unwrap();

        let err = OciImage::validate_oci_layout(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("oci-layout"));

        fs::write(tmp.path().join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        let err = OciImage::validate_oci_layout(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("index.json"));

        fs::write(tmp.path().join("index.json"), "{}").unwrap();
        let err = OciImage::validate_oci_layout(tmp.path()).unwrap_err();
        assert!(err.to_string().contains("blobs"));

        fs::create_dir_all(tmp.path().join("blobs/sha256")).unwrap();
        assert!(OciImage::validate_oci_layout(tmp.path()).is_ok());
    }

    const DIGEST_HEX: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn test_blob_path() {
        let root = PathBuf::from("/images/test");
        assert_eq!(
            OciImage::blob_path(&root, &format!("sha256:{}", DIGEST_HEX)).unwrap(),
            root.join("blobs/sha256").join(DIGEST_HEX)
        );
        assert!(OciImage::blob_path(&root, DIGEST_HEX).is_err());
        assert!(OciImage::blob_path(&root, "sha256:../../etc/passwd").is_err());
    }

    #[test]
    fn test_from_path_rejects_traversing_digest() {
        let tmp = TempDir::new().unwrap();
        OciLayoutBuilder::new()
            .layer(vec![LayerEntry::file("a", "1")])
            .write_to(tmp.path());
        fs::write(
            tmp.path().join("index.json"),
            r#"{"schemaVersion": 2, "manifests": [{
                "mediaType": "application/vnd.oci.image.manifest.v1+json",
                "digest": "sha256:../../../etc/passwd",
                "size": 10
            }]}"#,
        )
        .unwrap();

        let err = OciImage::from_path(tmp.path(), None).unwrap_err();
        assert!(matches!(err, BuildError::Validation { .. }));
        assert!(err.to_string().contains("sha256 digest"));
    }

    #[test]
    fn test_from_path_config_without_history() {
        let tmp = TempDir::new().unwrap();
        let digest = OciLayoutBuilder::new()
            .config(serde_json::json!({"Cmd": ["/bin/sh"]}))
            .layer(vec![LayerEntry::file("a", "1")])
            .write_to(tmp.path());

        // The fixture writes no `history`; an explicit null reads the same.
        let manifest: serde_json::Value = serde_json::from_slice(
            &fs::read(OciImage::blob_path(tmp.path(), &digest).unwrap()).unwrap(),
        )
        .unwrap();
        let config_path =
            OciImage::blob_path(tmp.path(), manifest["config"]["digest"].as_str().unwrap())
                .unwrap();
        let config: serde_json::Value =
            serde_json::from_slice(&fs::read(&config_path).unwrap()).unwrap();
        assert!(config.get("history").is_none());

        let image = OciImage::from_path(tmp.path(), None).unwrap();
        assert_eq!(image.config().cmd, Some(vec!["/bin/sh".to_string()]));

        let mut with_null = config;
        with_null["history"] = serde_json::Value::Null;
        fs::write(&config_path, serde_json::to_vec(&with_null).unwrap()).unwrap();
        assert!(read_image_config(&config_path).is_ok());
    }

    fn write_multi_platform_index(dir: &Path, platforms: &[(&str, &str)]) {
        let digest = OciLayoutBuilder::new()
            .layer(vec![LayerEntry::file("a", "1")])
            .write_to(dir);
        let manifests: Vec<_> = platforms
            .iter()
            .map(|(os, arch)| {
                serde_json::json!({
                    "mediaType": "application/vnd.oci.image.manifest.v1+json",
                    "digest": digest,
                    "size": 10,
                    "platform": {"os": os, "architecture": arch}
                })
            })
            .collect();
        fs::write(
            dir.join("index.json"),
            serde_json::to_vec(&serde_json::json!({"schemaVersion": 2, "manifests": manifests}))
                .unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_from_path_selects_platform() {
        let tmp = TempDir::new().unwrap();
        write_multi_platform_index(tmp.path(), &[("linux", "arm64"), ("linux", "amd64")]);
        assert!(OciImage::from_path(tmp.path(), Some(("linux", "amd64"))).is_ok());
    }

    #[test]
    fn test_from_path_platform_mismatch_is_error() {
        let tmp = TempDir::new().unwrap();
        write_multi_platform_index(tmp.path(), &[("linux", "arm64")]);

        let err = OciImage::from_path(tmp.path(), Some(("linux", "amd64"))).unwrap_err();
        assert!(matches!(err, BuildError::Validation { .. }));
        assert!(err.to_string().contains("linux/amd64"));

        // Without a requested platform the single manifest is used.
        assert!(OciImage::from_path(tmp.path(), None).is_ok());
    }

    #[test]
    fn test_from_path_parses_config_and_layers() {
        let tmp = TempDir::new().unwrap();
        OciLayoutBuilder::new()
            .config(serde_json::json!({
                "Entrypoint": ["/bin/app"],
                "Cmd": ["--port", "8080"],
                "Env": ["PATH=/usr/local/bin:/usr/bin:/bin", "EMPTY=", "MALFORMED"],
                "WorkingDir": "/srv",
                "User": "nobody",
                "ExposedPorts": {"8080/tcp": {}},
                "Labels": {"org.example.role": "web"}
            }))
            .layer(vec![LayerEntry::file("a", "1")])
            .layer(vec![LayerEntry::file("b", "2")])
            .write_to(tmp.path());

        let image = OciImage::from_path(tmp.path(), None).unwrap();
        let config = image.config();

        assert_eq!(config.entrypoint, Some(vec!["/bin/app".to_string()]));
        assert_eq!(config.cmd.as_ref().map(|c| c.len()), Some(2));
        assert_eq!(config.working_dir.as_deref(), Some("/srv"));
        assert_eq!(config.user.as_deref(), Some("nobody"));
        assert_eq!(config.exposed_ports, vec!["8080/tcp".to_string()]);
        assert_eq!(config.labels.get("org.example.role").map(String::as_str), Some("web"));
        assert_eq!(
            config.env,
            vec![
                ("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );

        assert_eq!(image.layers().len(), 2);
        assert!(image.layers().iter().all(|l| l.path.exists()));
        assert!(image.manifest_digest().starts_with("sha256:"));
    }

    #[test]
    fn test_from_path_empty_index() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("blobs/sha256")).unwrap();
        fs::write(tmp.path().join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).unwrap();
        fs::write(
            tmp.path().join("index.json"),
            r#"{"schemaVersion": 2, "manifests": []}"#,
        )
        .unwrap();

        let err = OciImage::from_path(tmp.path(), None).unwrap_err();
        assert!(err.to_string().contains("no manifests"));
    }

    #[test]
    fn test_from_path_missing_manifest_blob() {
        let tmp = TempDir::new().unwrap();
        OciLayoutBuilder::new()
            .layer(vec![LayerEntry::file("a", "1")])
            .write_to(tmp.path());

        let index: serde_json::Value =
            serde_json::from_slice(&fs::read(tmp.path().join("index.json")).unwrap()).unwrap();
        let digest = index["manifests"][0]["digest"].as_str().unwrap();
        fs::remove_file(OciImage::blob_path(tmp.path(), digest).unwrap()).unwrap();

        let err = OciImage::from_path(tmp.path(), None).unwrap_err();
        assert!(matches!(err, BuildError::Validation { .. }));
        assert!(err.to_string().contains(crate::digest::split_digest(digest).1));
    }

    #[test]
    fn test_from_path_nonexistent() {
        assert!(OciImage::from_path("/nonexistent/path", None).is_err());
    }
}
