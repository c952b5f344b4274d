//! `a3s-image version` command.

use clap::Args;

#[derive(Args)]
pub struct VersionArgs;

pub async fn execute(_args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("a3s-image version {}", a3s_image_builder::VERSION);
    println!(
        "image format version {}",
        a3s_image_builder::format::FORMAT_VERSION
    );
    Ok(())
}
