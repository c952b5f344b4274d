//! Directory ("sandbox") assembler.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use a3s_image_core::error::{BuildError, Result};

use super::{destination_parent, validate_target, Assembler};
use crate::bundle::Bundle;
use crate::fs::copy_tree;

/// Writes the bundle rootfs as a plain directory tree.
///
/// Metadata is not stored; the result is a writable root filesystem.
#[derive(Debug, Default)]
pub struct SandboxAssembler;

impl SandboxAssembler {
    pub fn new() -> Self {
        Self
    }
}

impl Assembler for SandboxAssembler {
    fn assemble(&self, bundle: &Bundle, destination: &Path) -> Result<()> {
        validate_target(bundle, destination)?;
        if std::fs::symlink_metadata(destination).is_ok() {
            return Err(BuildError::validation(
                destination.display().to_string(),
                "destination already exists",
            ));
        }

        let parent = destination_parent(destination);
        let staging = tempfile::Builder::new()
            .prefix(".a3s-sandbox-")
            .tempdir_in(&parent)
            .map_err(|e| BuildError::write(&parent, format!("failed to create temp directory: {}", e)))?;

        tracing::info!(destination = %destination.display(), "Assembling sandbox");

        let skipped = copy_tree(bundle.rootfs(), staging.path()).map_err(|e| {
            BuildError::write(staging.path(), e.to_string())
        })?;
        for path in &skipped {
            tracing::warn!(path = %path.display(), "Special file not copied into sandbox");
        }

        let mode = std::fs::metadata(bundle.rootfs())
            .map(|m| m.permissions().mode() & 0o7777)
            .unwrap_or(0o755);
        std::fs::set_permissions(staging.path(), std::fs::Permissions::from_mode(mode))
            .map_err(|e| BuildError::write(staging.path(), e))?;

        // After the rename the staging guard finds nothing left to remove.
        std::fs::rename(staging.path(), destination).map_err(|e| {
            BuildError::write(
                staging.path(),
                format!("failed to rename into {}: {}", destination.display(), e),
            )
        })?;

        tracing::info!(destination = %destination.display(), "Sandbox assembled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleMetadata;
    use tempfile::TempDir;

    fn sample_bundle(work: &Path) -> Bundle {
        let bundle = Bundle::create_in(work, BundleMetadata::new("local:/src")).unwrap();
        std::fs::create_dir(bundle.rootfs().join("etc")).unwrap();
        std::fs::write(bundle.rootfs().join("etc/os-release"), "ID=test\n").unwrap();
        std::os::unix::fs::symlink("etc/os-release", bundle.rootfs().join("release")).unwrap();
        bundle
    }

    #[test]
    fn test_sandbox_copies_tree() {
        let work = TempDir::new().unwrap();
        let bundle = sample_bundle(work.path());
        let dest = work.path().join("sandbox");

        SandboxAssembler::new().assemble(&bundle, &dest).unwrap();

        assert_eq!(
            std::fs::read_to_string(dest.join("etc/os-release")).unwrap(),
            "ID=test\n"
        );
        assert!(std::fs::symlink_metadata(dest.join("release"))
            .unwrap()
            .file_type()
            .is_symlink());
        // No staging directories left behind.
        let leftovers: Vec<_> = std::fs::read_dir(work.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".a3s-sandbox-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_sandbox_existing_destination_is_rejected() {
        let work = TempDir::new().unwrap();
        let bundle = sample_bundle(work.path());
        let dest = work.path().join("taken");
        std::fs::write(&dest, "x").unwrap();

        let err = SandboxAssembler::new().assemble(&bundle, &dest).unwrap_err();
        assert!(matches!(err, BuildError::Validation { .. }));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "x");
    }

    #[test]
    fn test_sandbox_missing_parent_is_write_error() {
        let work = TempDir::new().unwrap();
        let bundle = sample_bundle(work.path());
        let dest = work.path().join("missing/sandbox");

        let err = SandboxAssembler::new().assemble(&bundle, &dest).unwrap_err();
        assert!(matches!(err, BuildError::Write { .. }));
    }
}
