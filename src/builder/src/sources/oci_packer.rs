//! Packing of OCI image layouts, shared by registry and archive sources.

use std::path::Path;

use a3s_image_core::error::Result;
use a3s_image_core::BuildConfig;

use crate::bundle::{Bundle, BundleMetadata, FidelityReport};
use crate::digest;
use crate::oci::{LayerSquasher, OciImage, OciImageConfig};

/// Label recording the URI an image was built from.
pub const LABEL_SOURCE: &str = "org.a3s.image.source";

/// Label recording the manifest digest an image was built from.
pub const LABEL_DIGEST: &str = "org.a3s.image.digest";

/// Squash an OCI image layout into a bundle.
///
/// Every layer is checked against its manifest digest before it is
/// applied. Layers are applied in manifest order.
pub(crate) fn pack_layout(layout: &Path, source_uri: &str, config: &BuildConfig) -> Result<Bundle> {
    let platform = (config.platform_os.as_str(), config.platform_arch.as_str());
    let image = OciImage::from_path(layout, Some(platform))?;

    tracing::info!(
        source = %source_uri,
        digest = %image.manifest_digest(),
        layers = image.layers().len(),
        "Packing OCI image"
    );

    let mut report = FidelityReport::default();
    let metadata = translate_config(image.config(), source_uri, image.manifest_digest(), &mut report);
    let mut bundle = Bundle::create_in(&config.tmp_dir, metadata)?;
    bundle
        .report_mut()
        .dropped_features
        .extend(report.dropped_features);

    let mut squasher = LayerSquasher::new(bundle.rootfs());
    for layer in image.layers() {
        digest::verify_file(&layer.path, &layer.digest)?;
        squasher.apply(&layer.path)?;
    }
    squasher.finish(bundle.report_mut())?;

    let report = bundle.report();
    tracing::info!(
        source = %source_uri,
        layers = report.layers_applied,
        whiteouts = report.whiteouts_applied,
        lossless = report.is_lossless(),
        "OCI image packed"
    );
    Ok(bundle)
}

/// Translate an OCI image configuration into bundle metadata.
///
/// Fields with no bundle counterpart are recorded in `report`.
pub fn translate_config(
    config: &OciImageConfig,
    source_uri: &str,
    manifest_digest: &str,
    report: &mut FidelityReport,
) -> BundleMetadata {
    let mut metadata = BundleMetadata::new(source_uri);

    for (key, value) in &config.env {
        metadata.environment.insert(key.clone(), value.clone());
    }

    let mut labels: Vec<_> = config.labels.iter().collect();
    labels.sort();
    for (key, value) in labels {
        metadata.set_label(key.clone(), value.clone());
    }
    metadata.set_label(LABEL_SOURCE, source_uri);
    metadata.set_label(LABEL_DIGEST, manifest_digest);

    metadata.runscript = Some(generate_runscript(
        config.entrypoint.as_deref().unwrap_or_default(),
        config.cmd.as_deref().unwrap_or_default(),
        config.working_dir.as_deref(),
    ));

    if let Some(ref user) = config.user {
        if !user.is_empty() {
            report.drop_feature(format!("User {}", user));
        }
    }
    for port in &config.exposed_ports {
        report.drop_feature(format!("ExposedPorts {}", port));
    }
    for volume in &config.volumes {
        report.drop_feature(format!("Volumes {}", volume));
    }
    if let Some(ref signal) = config.stop_signal {
        report.drop_feature(format!("StopSignal {}", signal));
    }

    metadata
}

/// Generate the runscript for an image's entrypoint and command.
///
/// `cmd` supplies default arguments when the image is run without any;
/// with neither set, the runscript starts a shell.
pub fn generate_runscript(entrypoint: &[String], cmd: &[String], working_dir: Option<&str>) -> String {
    let mut script = String::from("#!/bin/sh\n");

    if let Some(dir) = working_dir.filter(|d| !d.is_empty()) {
        script.push_str(&format!("cd {} || exit 1\n", shell_quote(dir)));
    }

    if entrypoint.is_empty() && cmd.is_empty() {
        script.push_str("exec /bin/sh \"$@\"\n");
        return script;
    }

    if !cmd.is_empty() {
        script.push_str(&format!(
            "if [ $# -eq 0 ]; then set -- {}; fi\n",
            join_quoted(cmd)
        ));
    }
    if entrypoint.is_empty() {
        script.push_str("exec \"$@\"\n");
    } else {
        script.push_str(&format!("exec {} \"$@\"\n", join_quoted(entrypoint)));
    }
    script
}

/// Quote a word for POSIX sh.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn join_quoted(words: &[String]) -> String {
    words
        .iter()
        .map(|w| shell_quote(w))
        .collect::<Vec<_>>()
        .join(" ")
}
