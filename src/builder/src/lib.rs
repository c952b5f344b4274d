//! A3S Image Builder - image build pipeline.
//!
//! This module turns a build specification into an image: sources fetch
//! and pack a bundle (OCI layer squashing, hub downloads, local trees),
//! and assemblers serialize the bundle into the single-file image format
//! or a sandbox directory.

#![allow(clippy::result_large_err)]

pub mod assembler;
pub mod bundle;
pub mod digest;
pub mod filesystem;
pub mod format;
pub mod fs;
pub mod oci;
pub mod pipeline;
pub mod sources;

#[cfg(test)]
mod testutil;

// Re-export common types
pub use assembler::{AssembleStage, Assembler, AssemblerOptions, ImageAssembler, SandboxAssembler};
pub use bundle::{Bundle, BundleMetadata, FidelityReport};
pub use filesystem::{FilesystemPacker, FsType, TarFilesystem};
pub use format::{DescriptorKind, ImageDescriptor, ImageFile, ImageHeader, PartitionUsage};
pub use oci::{ImageReference, OciImage, OciImageConfig, RegistryAuth};
pub use pipeline::{BuildOutcome, CancelToken, Pipeline};
pub use sources::{Conveyor, ConveyorPacker, Packer};

/// A3S Image Builder version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
