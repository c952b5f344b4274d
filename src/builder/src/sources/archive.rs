//! OCI archive source (`oci-archive:` and `oci:`).
//!
//! The source is either an OCI image layout directory or a tarball of one,
//! optionally compressed. Both are staged as a layout directory and then
//! packed exactly like a registry image.

use std::path::{Path, PathBuf};

use a3s_image_core::error::{BuildError, Result};
use a3s_image_core::{BuildConfig, BuildSpecification, SourceKind};
use async_trait::async_trait;

use super::{not_staged, oci_packer, Conveyor, Packer, StagedSource};
use crate::bundle::Bundle;
use crate::filesystem::unpack_tar;
use crate::fs::copy_tree;
use crate::oci::layers::open_layer;
use crate::oci::OciImage;

/// Stages a local OCI image layout and squashes its layers.
pub struct ArchiveConveyorPacker {
    config: BuildConfig,
    staged: Option<StagedSource>,
}

impl ArchiveConveyorPacker {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            config,
            staged: None,
        }
    }

    fn layout_dir(staged: &StagedSource) -> PathBuf {
        staged.root().join("layout")
    }

    fn stage_directory(source: &Path, layout: &Path) -> Result<()> {
        OciImage::validate_oci_layout(source)?;
        let skipped = copy_tree(source, layout)?;
        if !skipped.is_empty() {
            tracing::warn!(
                source = %source.display(),
                count = skipped.len(),
                "Special files in OCI layout were not staged"
            );
        }
        Ok(())
    }

    fn stage_tarball(source: &Path, layout: &Path) -> Result<()> {
        let reader = open_layer(source)?;
        unpack_tar(reader, layout)?;
        OciImage::validate_oci_layout(layout)
    }
}

#[async_trait]
impl Conveyor for ArchiveConveyorPacker {
    async fn get(&mut self, spec: &BuildSpecification) -> Result<()> {
        self.staged = None;

        let source = Path::new(&spec.source);
        let meta = std::fs::metadata(source)
            .map_err(|e| BuildError::fetch(spec.uri(), format!("cannot read archive: {}", e)))?;

        let staged = StagedSource::create(&self.config.tmp_dir, spec)?;
        let layout = Self::layout_dir(&staged);

        tracing::info!(
            source = %source.display(),
            directory = meta.is_dir(),
            "Staging OCI archive"
        );
        if meta.is_dir() {
            Self::stage_directory(source, &layout)?;
        } else {
            Self::stage_tarball(source, &layout)?;
        }

        self.staged = Some(staged);
        Ok(())
    }
}

impl Packer for ArchiveConveyorPacker {
    fn pack(&mut self) -> Result<Bundle> {
        let staged = self
            .staged
            .as_ref()
            .ok_or_else(|| not_staged(SourceKind::Archive))?;
        oci_packer::pack_layout(&Self::layout_dir(staged), staged.uri(), &self.config)
    }
}
