//! `a3s-image inspect` command: show the header, sections and metadata
//! of an image file.

use std::path::PathBuf;

use a3s_image_builder::ImageFile;
use clap::Args;

use crate::output::{format_ago, format_bytes, new_table};

#[derive(Args)]
pub struct InspectArgs {
    /// Image file to inspect
    pub image: PathBuf,

    /// Recompute section digests and check the integrity block
    #[arg(long)]
    pub verify: bool,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: InspectArgs) -> Result<(), Box<dyn std::error::Error>> {
    let image = ImageFile::open(&args.image)?;
    if args.verify {
        image.verify()?;
    }
    let metadata = image.metadata()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&to_json(&image, args.verify)?)?);
        return Ok(());
    }

    let header = image.header();
    println!("Image:        {}", args.image.display());
    println!("UUID:         {}", header.uuid);
    println!("Format:       v{}", header.version);
    println!("Architecture: {}", header.arch);
    match header.created_at() {
        Some(created) => println!("Created:      {} ({})", created.to_rfc3339(), format_ago(&created)),
        None => println!("Created:      {}", header.created),
    }
    println!("Size:         {}", format_bytes(header.file_size));
    println!("Source:       {}", metadata.source);
    if args.verify {
        println!("Integrity:    verified");
    }
    println!();

    let mut table = new_table(&["ID", "KIND", "FS", "OFFSET", "SIZE", "SHA256"]);
    for desc in image.descriptors() {
        table.add_row([
            desc.id.to_string(),
            desc.kind.to_string(),
            desc.fs_type.to_string(),
            desc.offset.to_string(),
            format_bytes(desc.length),
            desc.digest_hex(),
        ]);
    }
    println!("{table}");

    if !metadata.labels.is_empty() {
        println!();
        println!("Labels:");
        for (key, value) in &metadata.labels {
            println!("  {}={}", key, value);
        }
    }
    if !metadata.environment.is_empty() {
        println!();
        println!("Environment:");
        for (key, value) in &metadata.environment {
            println!("  {}={}", key, value);
        }
    }
    if let Some(ref script) = metadata.runscript {
        println!();
        println!("Runscript:");
        for line in script.lines() {
            println!("  {}", line);
        }
    }
    Ok(())
}

fn to_json(image: &ImageFile, verified: bool) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    let header = image.header();
    let metadata = image.metadata()?;

    let sections: Vec<_> = image
        .descriptors()
        .iter()
        .map(|d| {
            serde_json::json!({
                "Id": d.id,
                "Kind": d.kind.to_string(),
                "FsType": d.fs_type.to_string(),
                "Offset": d.offset,
                "Length": d.length,
                "Link": d.link,
                "Sha256": d.digest_hex(),
            })
        })
        .collect();

    let labels: serde_json::Map<String, serde_json::Value> = metadata
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();

    Ok(serde_json::json!({
        "Path": image.path(),
        "Uuid": header.uuid.to_string(),
        "Version": header.version,
        "Architecture": header.arch,
        "Created": header.created_at().map(|t| t.to_rfc3339()),
        "Size": header.file_size,
        "Verified": verified,
        "Sections": sections,
        "Metadata": {
            "Source": metadata.source,
            "Env": metadata.environment,
            "Labels": labels,
            "Runscript": metadata.runscript,
            "TestScript": metadata.test_script,
        },
    }))
}
