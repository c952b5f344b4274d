//! Local root filesystem source (`local:`).

use std::path::PathBuf;

use a3s_image_core::error::{BuildError, Result};
use a3s_image_core::{BuildConfig, BuildSpecification, SourceKind};
use async_trait::async_trait;

use super::oci_packer::LABEL_SOURCE;
use super::{not_staged, Conveyor, Packer};
use crate::bundle::{Bundle, BundleMetadata};
use crate::fs::copy_tree;

/// Packs a directory that already holds a root filesystem.
///
/// Nothing is staged: the directory is read in place when packing and is
/// never modified.
pub struct LocalConveyorPacker {
    config: BuildConfig,
    /// Source directory and its URI, set by a successful `get`
    source: Option<(PathBuf, String)>,
}

impl LocalConveyorPacker {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            source: None,
        }
    }
}

#[async_trait]
impl Conveyor for LocalConveyorPacker {
    async fn get(&mut self, spec: &BuildSpecification) -> Result<()> {
        self.source = None;

        let path = PathBuf::from(&spec.source);
        let meta = std::fs::metadata(&path)
            .map_err(|e| BuildError::fetch(spec.uri(), format!("cannot read rootfs: {}", e)))?;
        if !meta.is_dir() {
            return Err(BuildError::fetch(spec.uri(), "rootfs is not a directory"));
        }

        tracing::debug!(rootfs = %path.display(), "Using local root filesystem");
        self.source = Some((path, spec.uri()));
        Ok(())
    }
}

impl Packer for LocalConveyorPacker {
    fn pack(&mut self) -> Result<Bundle> {
        let (path, uri) = self
            .source
            .as_ref()
            .ok_or_else(|| not_staged(SourceKind::Local))?;

        let mut metadata = BundleMetadata::new(uri.as_str());
        metadata.set_label(LABEL_SOURCE, uri.as_str());

        let mut bundle = Bundle::create_in(&self.config.tmp_dir, metadata)?;
        let skipped = copy_tree(path, bundle.rootfs())?;
        for entry in &skipped {
            tracing::warn!(path = %entry.display(), "Special file not copied into bundle");
        }
        bundle.report_mut().skipped_special.extend(skipped);

        tracing::info!(rootfs = %path.display(), "Local root filesystem packed");
        Ok(bundle)
    }
}
