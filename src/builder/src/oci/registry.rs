//! OCI registry client for fetching images into an OCI image layout.
//!
//! Uses the `oci-distribution` crate to talk to container registries
//! (Docker Hub, GHCR, etc.). Blobs of one image are fetched concurrently;
//! the layout records them in manifest order regardless of which download
//! finishes first.

use std::path::{Path, PathBuf};

use a3s_image_core::error::{BuildError, Result};
use futures::TryStreamExt;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

use super::reference::ImageReference;

/// Authentication credentials for a container registry.
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Create anonymous authentication (no credentials).
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Create basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Create authentication from environment variables.
    ///
    /// Reads `REGISTRY_USERNAME` and `REGISTRY_PASSWORD`.
    /// Falls back to anonymous if either is not set.
    pub fn from_env() -> Self {
        match (
            std::env::var("REGISTRY_USERNAME").ok(),
            std::env::var("REGISTRY_PASSWORD").ok(),
        ) {
            (Some(username), Some(password)) => Self::basic(username, password),
            _ => Self::anonymous(),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Settings for one registry fetch.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Maximum number of blobs downloaded at once
    pub concurrency: usize,
    /// Reach the registry over plain HTTP
    pub insecure: bool,
    /// Platform `(os, arch)` used to resolve multi-arch images
    pub platform: (String, String),
}

/// Result of fetching an image into an OCI layout.
#[derive(Debug, Clone)]
pub struct FetchedImage {
    /// Registry digest of the manifest
    pub manifest_digest: String,
    /// Number of layer blobs fetched
    pub layer_count: usize,
}

/// Fetches OCI images from a container registry.
pub struct RegistryFetcher {
    client: Client,
    auth: RegistryAuth,
    concurrency: usize,
}

impl RegistryFetcher {
    pub fn new(auth: RegistryAuth, options: &FetchOptions) -> Self {
        let (os, arch) = options.platform.clone();
        let config = ClientConfig {
            protocol: if options.insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            platform_resolver: Some(Box::new(move |manifests: &[ImageIndexEntry]| {
                resolve_platform(manifests, &os, &arch)
            })),
            ..Default::default()
        };

        Self {
            client: Client::new(config),
            auth,
            concurrency: options.concurrency.max(1),
        }
    }

    /// Fetch an image and write it as an OCI image layout to `target_dir`.
    ///
    /// The resulting directory contains `oci-layout`, `index.json` and
    /// `blobs/sha256/...`. Any failed blob aborts the whole fetch.
    pub async fn fetch(&self, reference: &ImageReference, target_dir: &Path) -> Result<FetchedImage> {
        let oci_ref = reference.to_oci_reference()?;
        let artifact = reference.full_reference();

        tracing::info!(
            reference = %reference,
            target = %target_dir.display(),
            "Fetching image from registry"
        );

        let blobs_dir = target_dir.join("blobs").join("sha256");
        tokio::fs::create_dir_all(&blobs_dir)
            .await
            .map_err(|e| BuildError::fetch(&artifact, format!("failed to create blobs directory: {}", e)))?;

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &self.auth.to_oci_auth())
            .await
            .map_err(|e| BuildError::fetch(&artifact, format!("failed to pull manifest: {}", e)))?;

        let manifest_file = blob_file(&blobs_dir, &manifest_digest)?;

        let mut blobs: Vec<&OciDescriptor> = vec![&manifest.config];
        blobs.extend(manifest.layers.iter());

        futures::stream::iter(blobs.into_iter().map(Ok::<_, BuildError>))
            .try_for_each_concurrent(self.concurrency, |descriptor| {
                self.fetch_blob(&oci_ref, descriptor, &blobs_dir)
            })
            .await?;

        write_layout(target_dir, &manifest_file, &manifest, &manifest_digest).await.map_err(|e| {
            BuildError::fetch(&artifact, format!("failed to write OCI layout: {}", e))
        })?;

        tracing::info!(
            reference = %reference,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            "Image fetched"
        );

        Ok(FetchedImage {
            manifest_digest,
            layer_count: manifest.layers.len(),
        })
    }

    /// Download one blob into the blobs directory.
    async fn fetch_blob(
        &self,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        blobs_dir: &Path,
    ) -> Result<()> {
        let path = blob_file(blobs_dir, &descriptor.digest)?;

        tracing::debug!(digest = %descriptor.digest, size = descriptor.size, "Fetching blob");

        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| BuildError::fetch(&descriptor.digest, format!("failed to create blob file: {}", e)))?;
        self.client
            .pull_blob(oci_ref, descriptor, &mut file)
            .await
            .map_err(|e| BuildError::fetch(&descriptor.digest, format!("failed to pull blob: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| BuildError::fetch(&descriptor.digest, format!("failed to write blob: {}", e)))?;

        Ok(())
    }
}

/// Path of a remote blob inside the blobs directory.
///
/// The digest comes from the registry and is validated before it becomes
/// part of a path.
fn blob_file(blobs_dir: &Path, digest: &str) -> Result<PathBuf> {
    Ok(blobs_dir.join(crate::digest::sha256_hex(digest)?))
}

/// Write `oci-layout`, the manifest blob and `index.json`.
async fn write_layout(
    target_dir: &Path,
    manifest_file: &Path,
    manifest: &OciImageManifest,
    manifest_digest: &str,
) -> std::io::Result<()> {
    let manifest_json = serde_json::to_vec(manifest)?;
    tokio::fs::write(manifest_file, &manifest_json).await?;

    tokio::fs::write(
        target_dir.join("oci-layout"),
        r#"{"imageLayoutVersion":"1.0.0"}"#,
    )
    .await?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": manifest_digest,
            "size": manifest_json.len()
        }]
    });
    tokio::fs::write(target_dir.join("index.json"), serde_json::to_vec_pretty(&index)?).await
}

/// Pick the manifest matching `(os, arch)` from an image index.
fn resolve_platform(manifests: &[ImageIndexEntry], os: &str, arch: &str) -> Option<String> {
    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == os && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
