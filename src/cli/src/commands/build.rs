//! `a3s-image build` command: Build an image from a source URI.
//!
//! Fetches the source, packs it into a bundle, applies the command-line
//! customizations and writes either a single-file image or a sandbox
//! directory at the destination.

use std::path::{Path, PathBuf};

use a3s_image_builder::{
    Assembler, AssemblerOptions, BuildOutcome, ImageAssembler, Pipeline, SandboxAssembler,
};
use a3s_image_core::{BuildConfig, BuildSpecification, FsKind};
use clap::Args;

use crate::output::parse_key_values;

#[derive(Args)]
pub struct BuildArgs {
    /// Output path (image file, or directory with --sandbox)
    pub destination: PathBuf,

    /// Source URI (docker://, shub://, oci-archive:, oci:, local: or a directory)
    pub source: String,

    /// Write a writable directory tree instead of an image file
    #[arg(long)]
    pub sandbox: bool,

    /// Add a label (KEY=VALUE), can be repeated
    #[arg(long = "label")]
    pub labels: Vec<String>,

    /// Set an environment variable (KEY=VALUE), can be repeated
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// File whose content replaces the runscript
    #[arg(long)]
    pub runscript: Option<PathBuf>,

    /// File whose content becomes the test script
    #[arg(long = "test")]
    pub test_script: Option<PathBuf>,

    /// Maximum concurrent blob downloads
    #[arg(short, long)]
    pub jobs: Option<usize>,

    /// Partition filesystem format (tar, tar-gzip)
    #[arg(long)]
    pub fs_type: Option<FsKind>,

    /// Configuration file (YAML or JSON)
    #[arg(long)]
    pub config: Option<PathBuf>,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(&args)?;
    let spec = build_spec(&args)?;
    tracing::debug!(?config, source = %spec, "Resolved build configuration");

    let assembler: Box<dyn Assembler> = if args.sandbox {
        Box::new(SandboxAssembler::new())
    } else {
        Box::new(ImageAssembler::new(AssemblerOptions::from_config(&config)))
    };
    let pipeline = Pipeline::new(config, assembler);

    // Ctrl-C stops the build at the next stage boundary.
    let token = pipeline.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Interrupted, stopping build...");
            token.cancel();
        }
    });

    let result = pipeline.run(&spec, &args.destination).await;
    interrupt.abort();

    print_outcome(&result?);
    Ok(())
}

/// Resolve configuration: file, then environment, then flags.
fn load_config(args: &BuildArgs) -> Result<BuildConfig, Box<dyn std::error::Error>> {
    let config = match &args.config {
        Some(path) => BuildConfig::load(path)?,
        None => BuildConfig::load_default()?,
    };
    let mut config = config.with_env_overrides()?;

    if let Some(jobs) = args.jobs {
        config.fetch_concurrency = jobs;
    }
    if let Some(fs_type) = args.fs_type {
        config.fs_type = fs_type;
    }
    config.validate()?;
    Ok(config)
}

fn build_spec(args: &BuildArgs) -> Result<BuildSpecification, Box<dyn std::error::Error>> {
    let mut spec = BuildSpecification::from_uri(&args.source)?;
    spec.labels = parse_key_values(&args.labels, "label")?;
    spec.environment = parse_key_values(&args.env, "env")?;
    if let Some(ref path) = args.runscript {
        spec.runscript = Some(read_script(path)?);
    }
    if let Some(ref path) = args.test_script {
        spec.test_script = Some(read_script(path)?);
    }
    Ok(spec)
}

fn read_script(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read script {}: {}", path.display(), e))
}

fn print_outcome(outcome: &BuildOutcome) {
    let report = &outcome.report;
    println!(
        "Built {} from {} in {:.1}s",
        outcome.destination.display(),
        outcome.source,
        outcome.duration.as_secs_f64()
    );
    if report.layers_applied > 0 {
        println!(
            "  {} layers applied, {} deletions",
            report.layers_applied, report.whiteouts_applied
        );
    }
    if !report.ownership_preserved {
        println!("  File ownership was not preserved (run as root to keep it)");
    }
    for path in &report.skipped_special {
        println!("  Skipped special file: {}", path.display());
    }
    for feature in &report.dropped_features {
        println!("  Dropped: {}", feature);
    }
}
