//! Assemblers serialize a bundle to its final on-disk form.
//!
//! - [`ImageAssembler`] writes the single-file image format
//! - [`SandboxAssembler`] writes the rootfs as a plain directory tree
//!
//! Both write into a temporary location next to the destination and
//! rename it into place only once everything succeeded.

mod image;
mod sandbox;

pub use image::ImageAssembler;
pub use sandbox::SandboxAssembler;

use std::path::{Path, PathBuf};

use a3s_image_core::config::host_arch;
use a3s_image_core::error::{BuildError, Result};
use a3s_image_core::{BuildConfig, FsKind};

use crate::bundle::Bundle;

/// Writes a bundle to a destination path.
pub trait Assembler: Send + Sync {
    /// Serialize `bundle` to `destination`.
    ///
    /// On failure nothing is left at `destination` and temporary output
    /// is removed.
    fn assemble(&self, bundle: &Bundle, destination: &Path) -> Result<()>;
}

/// Settings for image assembly.
#[derive(Debug, Clone)]
pub struct AssemblerOptions {
    /// Partition filesystem format
    pub fs_type: FsKind,
    /// Clamp for file modification times in the partition
    pub mtime_clamp: Option<u64>,
    /// Append an integrity block
    pub integrity_block: bool,
    /// Architecture recorded in the header
    pub arch: String,
    /// Directory for the partition spool file (system default when unset)
    pub spool_dir: Option<PathBuf>,
}

impl Default for AssemblerOptions {
    fn default() -> Self {
        Self {
            fs_type: FsKind::Tar,
            mtime_clamp: None,
            integrity_block: true,
            arch: host_arch().to_string(),
            spool_dir: None,
        }
    }
}

impl AssemblerOptions {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            fs_type: config.fs_type,
            mtime_clamp: config.source_date_epoch,
            integrity_block: config.integrity_block,
            arch: config.platform_arch.clone(),
            spool_dir: Some(config.tmp_dir.clone()),
        }
    }
}

/// Progress of one assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssembleStage {
    Validating,
    Packing,
    Writing,
    Finalizing,
    Done,
    Failed,
}

impl std::fmt::Display for AssembleStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AssembleStage::Validating => "validating",
            AssembleStage::Packing => "packing",
            AssembleStage::Writing => "writing",
            AssembleStage::Finalizing => "finalizing",
            AssembleStage::Done => "done",
            AssembleStage::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Directory the destination will be created in.
fn destination_parent(destination: &Path) -> PathBuf {
    match destination.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Checks shared by all assemblers, run before any byte is written.
fn validate_target(bundle: &Bundle, destination: &Path) -> Result<()> {
    bundle.validate()?;
    if destination.file_name().is_none() {
        return Err(BuildError::validation(
            destination.display().to_string(),
            "destination has no file name",
        ));
    }
    if destination.is_dir() {
        return Err(BuildError::validation(
            destination.display().to_string(),
            "destination is an existing directory",
        ));
    }
    Ok(())
}
