//! Build pipeline: get → pack → customize → assemble.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use a3s_image_core::error::{BuildError, Result};
use a3s_image_core::{BuildConfig, BuildSpecification};

use crate::assembler::Assembler;
use crate::bundle::FidelityReport;
use crate::sources;

/// Cooperative cancellation flag shared between a pipeline and its caller.
///
/// Checked at every stage boundary; a stage in progress runs to completion.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Canonical URI of the source
    pub source: String,
    /// Where the output was written
    pub destination: PathBuf,
    /// What was kept or lost while packing
    pub report: FidelityReport,
    pub duration: Duration,
}

/// Drives one build from specification to output.
pub struct Pipeline {
    config: BuildConfig,
    assembler: Box<dyn Assembler>,
    cancel: CancelToken,
}

impl Pipeline {
    pub fn new(config: BuildConfig, assembler: Box<dyn Assembler>) -> Self {
        Self {
            config,
            assembler,
            cancel: CancelToken::new(),
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Build `spec` into `destination`.
    ///
    /// Stage failures are wrapped with the source URI and stage name. All
    /// staging and bundle directories are released whether the build
    /// succeeds, fails or is cancelled.
    pub async fn run(&self, spec: &BuildSpecification, destination: &Path) -> Result<BuildOutcome> {
        let uri = spec.uri();
        let started = Instant::now();
        tracing::info!(source = %uri, destination = %destination.display(), "Starting build");

        self.check_cancelled(&uri, "get")?;
        let mut source = sources::for_spec(spec.kind, &self.config);
        source.get(spec).await.map_err(|e| e.in_stage(&uri, "get"))?;

        self.check_cancelled(&uri, "pack")?;
        let mut bundle = source.pack().map_err(|e| e.in_stage(&uri, "pack"))?;
        // Staged artifacts are no longer needed once the bundle exists.
        drop(source);
        bundle.metadata_mut().apply_customizations(spec);
        tracing::info!(
            source = %uri,
            rootfs_bytes = crate::fs::dir_size(bundle.rootfs()),
            "Bundle packed"
        );

        self.check_cancelled(&uri, "assemble")?;
        self.assembler
            .assemble(&bundle, destination)
            .map_err(|e| e.in_stage(&uri, "assemble"))?;

        let report = bundle.report().clone();
        if let Err(e) = bundle.cleanup() {
            tracing::warn!(error = %e, "Failed to remove bundle");
        }

        let outcome = BuildOutcome {
            source: uri,
            destination: destination.to_path_buf(),
            report,
            duration: started.elapsed(),
        };
        tracing::info!(
            source = %outcome.source,
            destination = %outcome.destination.display(),
            lossless = outcome.report.is_lossless(),
            elapsed_ms = outcome.duration.as_millis() as u64,
            "Build complete"
        );
        Ok(outcome)
    }

    fn check_cancelled(&self, uri: &str, next_stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::info!(source = %uri, stage = next_stage, "Build cancelled");
            return Err(BuildError::Cancelled(format!(
                "{} cancelled before {}",
                uri, next_stage
            )));
        }
        Ok(())
    }
}
