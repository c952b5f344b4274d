//! Image hub source (`shub://`).
//!
//! The hub API describes a container by collection and tag:
//!
//! ```text
//! GET <hub_url>/api/container/<user>/<collection>:<tag>
//! {"image": "<download url>", "version": "<sha256 hex>", "name": "..."}
//! ```
//!
//! The downloaded file is either an image in our own format or a
//! (compressed) tar of a root filesystem.

use std::io::Read;
use std::path::{Path, PathBuf};

use a3s_image_core::error::{BuildError, Result};
use a3s_image_core::{BuildConfig, BuildSpecification, SourceKind};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::oci_packer::LABEL_SOURCE;
use super::{not_staged, Conveyor, Packer, StagedSource};
use crate::bundle::{Bundle, BundleMetadata};
use crate::digest;
use crate::filesystem::unpack_tar;
use crate::format::header::has_magic;
use crate::format::ImageFile;
use crate::oci::layers::open_layer;

/// Default tag when none is given.
const DEFAULT_TAG: &str = "latest";

/// Leading bytes of a squashfs filesystem.
const SQUASHFS_MAGIC: &[u8] = b"hsqs";

/// Parsed `user/collection[:tag]` hub path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubReference {
    pub collection: String,
    pub tag: String,
}

impl HubReference {
    pub fn parse(source: &str) -> Result<Self> {
        let source = source.trim().trim_start_matches('/');
        let last_segment_start = source.rfind('/').map_or(0, |pos| pos + 1);
        let (collection, tag) = match source[last_segment_start..].rfind(':') {
            Some(colon) => {
                let split = last_segment_start + colon;
                (&source[..split], &source[split + 1..])
            }
            None => (source, DEFAULT_TAG),
        };

        let segments: Vec<&str> = collection.split('/').collect();
        if segments.len() < 2 || segments.iter().any(|s| s.is_empty()) || tag.is_empty() {
            return Err(BuildError::validation(
                source,
                "hub reference must look like user/collection[:tag]",
            ));
        }

        Ok(Self {
            collection: collection.to_string(),
            tag: tag.to_string(),
        })
    }

    /// URL of the container description.
    pub fn api_url(&self, hub_url: &str) -> String {
        format!(
            "{}/api/container/{}:{}",
            hub_url.trim_end_matches('/'),
            self.collection,
            self.tag
        )
    }
}

impl std::fmt::Display for HubReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.collection, self.tag)
    }
}

/// Container description returned by the hub API.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct HubManifest {
    /// Download URL of the image file
    pub image: String,
    /// Content hash of the image file, when published
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl HubManifest {
    /// The published SHA-256 of the image, if `version` is one.
    pub fn sha256(&self) -> Option<&str> {
        self.version
            .as_deref()
            .filter(|v| v.len() == 64 && v.chars().all(|c| c.is_ascii_hexdigit()))
    }
}

/// Downloads an image from an image hub and unpacks it.
pub struct HubConveyorPacker {
    config: BuildConfig,
    http: reqwest::Client,
    staged: Option<StagedSource>,
}

impl HubConveyorPacker {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            staged: None,
        }
    }

    fn image_path(staged: &StagedSource) -> PathBuf {
        staged.root().join("image")
    }

    async fn fetch_manifest(&self, reference: &HubReference) -> Result<HubManifest> {
        let url = reference.api_url(&self.config.hub_url);
        let artifact = format!("shub://{}", reference);
        tracing::debug!(url = %url, "Fetching hub manifest");

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| BuildError::fetch(&artifact, format!("hub request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BuildError::fetch(
                &artifact,
                format!("hub returned {} for {}", response.status(), url),
            ));
        }

        response
            .json::<HubManifest>()
            .await
            .map_err(|e| BuildError::fetch(&artifact, format!("invalid hub manifest: {}", e)))
    }

    async fn download(&self, url: &str, target: &Path) -> Result<u64> {
        tracing::info!(url = %url, "Downloading hub image");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| BuildError::fetch(url, format!("download failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(BuildError::fetch(
                url,
                format!("download returned {}", response.status()),
            ));
        }

        let mut file = tokio::fs::File::create(target)
            .await
            .map_err(|e| BuildError::fetch(url, format!("failed to create {}: {}", target.display(), e)))?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| BuildError::fetch(url, format!("download interrupted: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| BuildError::fetch(url, format!("failed to write download: {}", e)))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| BuildError::fetch(url, format!("failed to write download: {}", e)))?;

        tracing::debug!(url = %url, bytes = written, "Download complete");
        Ok(written)
    }

    /// Unpack a downloaded image in our own format.
    fn pack_image_file(&self, path: &Path, uri: &str) -> Result<Bundle> {
        let image = ImageFile::open(path)?;
        image.verify()?;

        let mut metadata = image.metadata()?;
        metadata.source = uri.to_string();
        metadata.set_label(LABEL_SOURCE, uri);

        let mut bundle = Bundle::create_in(&self.config.tmp_dir, metadata)?;
        let skipped = image.extract_partition(bundle.rootfs())?;
        bundle.report_mut().skipped_special.extend(skipped);
        Ok(bundle)
    }

    /// Unpack a downloaded root filesystem tarball.
    fn pack_rootfs_archive(&self, path: &Path, uri: &str) -> Result<Bundle> {
        let mut metadata = BundleMetadata::new(uri);
        metadata.set_label(LABEL_SOURCE, uri);

        let reader = open_layer(path)?;
        let mut bundle = Bundle::create_in(&self.config.tmp_dir, metadata)?;
        let skipped = unpack_tar(reader, bundle.rootfs())?;
        bundle.report_mut().skipped_special.extend(skipped);
        Ok(bundle)
    }
}

#[async_trait]
impl Conveyor for HubConveyorPacker {
    async fn get(&mut self, spec: &BuildSpecification) -> Result<()> {
        self.staged = None;

        let reference = HubReference::parse(&spec.source)?;
        let staged = StagedSource::create(&self.config.tmp_dir, spec)?;

        let manifest = self.fetch_manifest(&reference).await?;
        let image_path = Self::image_path(&staged);
        self.download(&manifest.image, &image_path).await?;

        if let Some(expected) = manifest.sha256() {
            digest::verify_file(&image_path, &format!("sha256:{}", expected))?;
        }

        tracing::info!(reference = %reference, name = ?manifest.name, "Hub image fetched");
        self.staged = Some(staged);
        Ok(())
    }
}

impl Packer for HubConveyorPacker {
    fn pack(&mut self) -> Result<Bundle> {
        let staged = self.staged.as_ref().ok_or_else(|| not_staged(SourceKind::Hub))?;
        let path = Self::image_path(staged);

        let mut head = Vec::with_capacity(8);
        std::fs::File::open(&path)
            .and_then(|file| file.take(8).read_to_end(&mut head))
            .map_err(|e| {
                BuildError::validation(path.display().to_string(), format!("failed to read: {}", e))
            })?;

        if has_magic(&head) {
            self.pack_image_file(&path, staged.uri())
        } else if head.starts_with(SQUASHFS_MAGIC) {
            Err(BuildError::unsupported(
                "squashfs image",
                format!("cannot unpack {}", path.display()),
            ))
        } else {
            self.pack_rootfs_archive(&path, staged.uri())
        }
    }
}
