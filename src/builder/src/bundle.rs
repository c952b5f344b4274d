//! Bundle: a built but not yet serialized image.
//!
//! A bundle owns a scratch root filesystem directory plus the generic
//! metadata every source kind is translated into. Packers create bundles,
//! assemblers consume them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use a3s_image_core::error::{BuildError, Result};
use a3s_image_core::BuildSpecification;
use tempfile::TempDir;

/// Generic image metadata carried from packer to assembler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BundleMetadata {
    /// URI of the source the bundle was built from
    pub source: String,
    /// Environment variables (unique keys)
    pub environment: BTreeMap<String, String>,
    /// Labels and build history, in insertion order
    pub labels: Vec<(String, String)>,
    /// Script run when the image is executed
    pub runscript: Option<String>,
    /// Script run when the image is tested
    pub test_script: Option<String>,
}

impl BundleMetadata {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Set a label, replacing an existing value in place.
    pub fn set_label(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.labels.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.labels.push((key, value)),
        }
    }

    /// Get a label value by key.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Apply the customizations of a build specification.
    ///
    /// Specification values win over values translated from the source.
    pub fn apply_customizations(&mut self, spec: &BuildSpecification) {
        for (key, value) in &spec.environment {
            self.environment.insert(key.clone(), value.clone());
        }
        for (key, value) in &spec.labels {
            self.set_label(key.clone(), value.clone());
        }
        if let Some(ref script) = spec.runscript {
            self.runscript = Some(script.clone());
        }
        if let Some(ref script) = spec.test_script {
            self.test_script = Some(script.clone());
        }
    }
}

/// Record of fidelity lost or kept while producing a bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FidelityReport {
    /// Number of layers applied to the rootfs
    pub layers_applied: usize,
    /// Number of deletion markers honored
    pub whiteouts_applied: usize,
    /// Special files (devices, FIFOs, sockets) that could not be created
    pub skipped_special: Vec<PathBuf>,
    /// Whether file ownership was restored
    pub ownership_preserved: bool,
    /// Source features dropped during translation
    pub dropped_features: Vec<String>,
}

impl FidelityReport {
    /// Whether anything was lost.
    pub fn is_lossless(&self) -> bool {
        self.skipped_special.is_empty() && self.ownership_preserved && self.dropped_features.is_empty()
    }

    /// Record a dropped feature and warn about it.
    pub fn drop_feature(&mut self, feature: impl Into<String>) {
        let feature = feature.into();
        tracing::warn!(feature = %feature, "Dropping unsupported source feature");
        self.dropped_features.push(feature);
    }
}

/// Root filesystem plus metadata, ready for an assembler.
#[derive(Debug)]
pub struct Bundle {
    rootfs: TempDir,
    metadata: BundleMetadata,
    report: FidelityReport,
}

impl Bundle {
    /// Create a bundle with an empty, uniquely named rootfs under `parent`.
    pub fn create_in(parent: &Path, metadata: BundleMetadata) -> Result<Self> {
        std::fs::create_dir_all(parent).map_err(|e| {
            BuildError::Other(format!(
                "Failed to create bundle parent {}: {}",
                parent.display(),
                e
            ))
        })?;

        let rootfs = tempfile::Builder::new()
            .prefix("a3s-bundle-")
            .tempdir_in(parent)
            .map_err(|e| {
                BuildError::Other(format!(
                    "Failed to create bundle rootfs in {}: {}",
                    parent.display(),
                    e
                ))
            })?;

        tracing::debug!(rootfs = %rootfs.path().display(), "Created bundle");

        Ok(Self {
            rootfs,
            metadata,
            report: FidelityReport {
                ownership_preserved: crate::fs::is_privileged(),
                ..Default::default()
            },
        })
    }

    pub fn rootfs(&self) -> &Path {
        self.rootfs.path()
    }

    pub fn metadata(&self) -> &BundleMetadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut BundleMetadata {
        &mut self.metadata
    }

    pub fn report(&self) -> &FidelityReport {
        &self.report
    }

    pub fn report_mut(&mut self) -> &mut FidelityReport {
        &mut self.report
    }

    /// Check the bundle can be handed to an assembler.
    pub fn validate(&self) -> Result<()> {
        let rootfs = self.rootfs();
        if !rootfs.is_dir() {
            return Err(BuildError::validation(
                rootfs.display().to_string(),
                "bundle rootfs does not exist",
            ));
        }
        if !crate::fs::is_non_empty_dir(rootfs) {
            return Err(BuildError::validation(
                rootfs.display().to_string(),
                "bundle rootfs is empty",
            ));
        }
        Ok(())
    }

    /// Remove the rootfs, reporting failures instead of ignoring them.
    pub fn cleanup(self) -> Result<()> {
        let path = self.rootfs.path().to_path_buf();
        self.rootfs.close().map_err(|e| {
            BuildError::Other(format!(
                "Failed to remove bundle rootfs {}: {}",
                path.display(),
                e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use a3s_image_core::SourceKind;
    use tempfile::TempDir;

    #[test]
    fn test_create_bundle_has_empty_rootfs() {
        let tmp = TempDir::new().unwrap();
        let bundle = Bundle::create_in(tmp.path(), BundleMetadata::new("local:/x")).unwrap();
        assert!(bundle.rootfs().is_dir());
        assert!(bundle.rootfs().starts_with(tmp.path()));
        assert_eq!(bundle.metadata().source, "local:/x");
    }

    #[test]
    fn test_validate_rejects_empty_rootfs() {
        let tmp = TempDir::new().unwrap();
        let bundle = Bundle::create_in(tmp.path(), BundleMetadata::default()).unwrap();
        let err = bundle.validate().unwrap_err();
        assert!(matches!(err, BuildError::Validation { .. }));
        assert!(err.to_string().contains("empty"));

        std::fs::write(bundle.rootfs().join("file"), "x").unwrap();
        assert!(bundle.validate().is_ok());
    }

    #[test]
    fn test_cleanup_removes_rootfs() {
        let tmp = TempDir::new().unwrap();
        let bundle = Bundle::create_in(tmp.path(), BundleMetadata::default()).unwrap();
        let rootfs = bundle.rootfs().to_path_buf();
        std::fs::write(rootfs.join("file"), "x").unwrap();

        bundle.cleanup().unwrap();
        assert!(!rootfs.exists());
    }

    #[test]
    fn test_drop_removes_rootfs() {
        let tmp = TempDir::new().unwrap();
        let rootfs = {
            let bundle = Bundle::create_in(tmp.path(), BundleMetadata::default()).unwrap();
            bundle.rootfs().to_path_buf()
        };
        assert!(!rootfs.exists());
    }

    #[test]
    fn test_set_label_replaces_in_place() {
        let mut meta = BundleMetadata::default();
        meta.set_label("a", "1");
        meta.set_label("b", "2");
        meta.set_label("a", "3");
        assert_eq!(
            meta.labels,
            vec![
                ("a".to_string(), "3".to_string()),
                ("b".to_string(), "2".to_string())
            ]
        );
        assert_eq!(meta.label("a"), Some("3"));
        assert_eq!(meta.label("c"), None);
    }

    #[test]
    fn test_apply_customizations_overrides_source_values() {
        let mut meta = BundleMetadata::new("docker://alpine");
        meta.environment.insert("PATH".to_string(), "/bin".to_string());
        meta.runscript = Some("#!/bin/sh\nexec /bin/sh\n".to_string());
        meta.set_label("version", "1");

        let spec = BuildSpecification::new(SourceKind::Registry, "alpine")
            .with_env("PATH", "/usr/bin:/bin")
            .with_env("LANG", "C")
            .with_label("version", "2")
            .with_test_script("#!/bin/sh\ntrue\n");
        meta.apply_customizations(&spec);

        assert_eq!(meta.environment["PATH"], "/usr/bin:/bin");
        assert_eq!(meta.environment["LANG"], "C");
        assert_eq!(meta.label("version"), Some("2"));
        assert_eq!(meta.runscript.as_deref(), Some("#!/bin/sh\nexec /bin/sh\n"));
        assert_eq!(meta.test_script.as_deref(), Some("#!/bin/sh\ntrue\n"));
    }

    #[test]
    fn test_fidelity_report() {
        let mut report = FidelityReport {
            ownership_preserved: true,
            ..Default::default()
        };
        assert!(report.is_lossless());
        report.drop_feature("config.User");
        assert!(!report.is_lossless());
        assert_eq!(report.dropped_features, vec!["config.User".to_string()]);
    }
}
