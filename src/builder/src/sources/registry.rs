//! Registry source (`docker://`).

use std::path::PathBuf;

use a3s_image_core::error::Result;
use a3s_image_core::{BuildConfig, BuildSpecification, SourceKind};
use async_trait::async_trait;

use super::{not_staged, oci_packer, Conveyor, Packer, StagedSource};
use crate::bundle::Bundle;
use crate::oci::{FetchOptions, ImageReference, RegistryAuth, RegistryFetcher};

/// Fetches an image from a container registry into an OCI layout and
/// squashes its layers.
pub struct RegistryConveyorPacker {
    config: BuildConfig,
    auth: RegistryAuth,
    staged: Option<StagedSource>,
}

impl RegistryConveyorPacker {
    /// Create a registry source using credentials from the environment.
    pub fn new(config: BuildConfig) -> Self {
        Self::with_auth(config, RegistryAuth::from_env())
    }

    pub fn with_auth(config: BuildConfig, auth: RegistryAuth) -> Self {
        Self {
            config,
            auth,
            staged: None,
        }
    }

    fn layout_dir(staged: &StagedSource) -> PathBuf {
        staged.root().join("layout")
    }
}

#[async_trait]
impl Conveyor for RegistryConveyorPacker {
    async fn get(&mut self, spec: &BuildSpecification) -> Result<()> {
        self.staged = None;

        let reference = ImageReference::parse(&spec.source)?;
        let options = FetchOptions {
            concurrency: self.config.fetch_concurrency,
            insecure: self.config.is_insecure(&reference.registry),
            platform: (
                self.config.platform_os.clone(),
                self.config.platform_arch.clone(),
            ),
        };

        let staged = StagedSource::create(&self.config.tmp_dir, spec)?;
        let fetcher = RegistryFetcher::new(self.auth.clone(), &options);
        fetcher.fetch(&reference, &Self::layout_dir(&staged)).await?;

        self.staged = Some(staged);
        Ok(())
    }
}

impl Packer for RegistryConveyorPacker {
    fn pack(&mut self) -> Result<Bundle> {
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| not_staged(SourceKind::Registry))?;
        oci_packer::pack_layout(&Self::layout_dir(staged), staged.uri(), &self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_image_core::BuildError;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_get_unreachable_registry_leaves_no_staging() {
        let tmp = TempDir::new().unwrap();
        let config = BuildConfig {
            tmp_dir: tmp.path().to_path_buf(),
            insecure_registries: vec!["127.0.0.1:1".to_string()],
            ..Default::default()
        };
        let mut source = RegistryConveyorPacker::with_auth(config, RegistryAuth::anonymous());
        let spec = BuildSpecification::new(SourceKind::Registry, "127.0.0.1:1/library/alpine:3");

        let err = source.get(&spec).await.unwrap_err();
        assert!(matches!(err, BuildError::Fetch { .. }));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        assert!(source.pack().is_err());
    }

    #[tokio::test]
    async fn test_get_invalid_reference() {
        let tmp = TempDir::new().unwrap();
        let config = BuildConfig {
            tmp_dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let mut source = RegistryConveyorPacker::new(config);
        let spec = BuildSpecification::new(SourceKind::Registry, "alpine:");

        let err = source.get(&spec).await.unwrap_err();
        assert!(matches!(err, BuildError::Validation { .. }));
    }
}
