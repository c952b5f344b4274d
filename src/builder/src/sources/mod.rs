//! Build sources: one conveyor/packer pair per source kind.
//!
//! A [`Conveyor`] fetches everything a build needs into a private staging
//! directory; the paired [`Packer`] turns the staged artifacts into a
//! [`Bundle`]. The pipeline only sees the combined [`ConveyorPacker`]
//! chosen by [`for_spec`].

mod archive;
mod hub;
mod local;
mod oci_packer;
mod registry;

pub use archive::ArchiveConveyorPacker;
pub use hub::{HubConveyorPacker, HubManifest, HubReference};
pub use local::LocalConveyorPacker;
pub use oci_packer::{generate_runscript, shell_quote, translate_config};
pub use registry::RegistryConveyorPacker;

use std::path::Path;

use a3s_image_core::error::{BuildError, Result};
use a3s_image_core::{BuildConfig, BuildSpecification, SourceKind};
use async_trait::async_trait;
use tempfile::TempDir;

use crate::bundle::Bundle;

/// Fetches the artifacts of a build specification.
#[async_trait]
pub trait Conveyor: Send {
    /// Fetch everything `spec` needs into fresh staging.
    ///
    /// Previously staged state is discarded first. On failure no staging
    /// is left behind.
    async fn get(&mut self, spec: &BuildSpecification) -> Result<()>;
}

/// Turns staged artifacts into a bundle.
pub trait Packer: Send {
    /// Build a bundle from what the last successful `get` staged.
    fn pack(&mut self) -> Result<Bundle>;
}

/// A conveyor together with the packer that understands its output.
pub trait ConveyorPacker: Conveyor + Packer {}

impl<T: Conveyor + Packer> ConveyorPacker for T {}

/// Create the conveyor/packer pair for a specification's source kind.
pub fn for_spec(kind: SourceKind, config: &BuildConfig) -> Box<dyn ConveyorPacker> {
    match kind {
        SourceKind::Registry => Box::new(RegistryConveyorPacker::new(config.clone())),
        SourceKind::Hub => Box::new(HubConveyorPacker::new(config.clone())),
        SourceKind::Archive => Box::new(ArchiveConveyorPacker::new(config.clone())),
        SourceKind::Local => Box::new(LocalConveyorPacker::new(config.clone())),
    }
}

/// Private staging directory of one fetch, removed on drop.
#[derive(Debug)]
pub struct StagedSource {
    root: TempDir,
    /// URI of the source that was staged
    uri: String,
}

impl StagedSource {
    /// Create a uniquely named staging directory under `tmp_dir`.
    pub fn create(tmp_dir: &Path, spec: &BuildSpecification) -> Result<Self> {
        std::fs::create_dir_all(tmp_dir).map_err(|e| {
            BuildError::Other(format!(
                "Failed to create temp directory {}: {}",
                tmp_dir.display(),
                e
            ))
        })?;

        let root = tempfile::Builder::new()
            .prefix(&format!("a3s-stage-{}-", spec.kind))
            .tempdir_in(tmp_dir)
            .map_err(|e| {
                BuildError::Other(format!(
                    "Failed to create staging directory in {}: {}",
                    tmp_dir.display(),
                    e
                ))
            })?;

        tracing::debug!(staging = %root.path().display(), source = %spec.uri(), "Created staging directory");
        Ok(Self {
            root,
            uri: spec.uri(),
        })
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }
}

/// Error for `pack` called without a successful `get`.
fn not_staged(kind: SourceKind) -> BuildError {
    BuildError::Other(format!("{} source packed before a successful get", kind))
}
