//! `cdcfs put`: import a host file as a plain file.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::Args;
use console::style;

use crate::units::format_bytes;

#[derive(Args, Debug)]
pub struct PutArgs {
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Host file to import
    #[arg(value_name = "FILE")]
    source: PathBuf,

    /// Name on the volume (defaults to the host file name)
    #[arg(short, long)]
    name: Option<String>,
}

pub fn run(args: PutArgs) -> Result<()> {
    let name = match args.name {
        Some(name) => name,
        None => args
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| anyhow!("Cannot derive a name from {}", args.source.display()))?,
    };

    let file = File::open(&args.source)
        .with_context(|| format!("Failed to open {}", args.source.display()))?;
    let size = file.metadata()?.len();

    let fs = crate::open_image(&args.image)?;
    let handle = fs
        .volume()
        .create_file_from_reader(&name, size, BufReader::new(file))
        .with_context(|| format!("Failed to import {} as '{}'", args.source.display(), name))?;
    fs.sync()?;

    println!(
        "{} {} ({}, inode {})",
        style("Imported").green().bold(),
        style(&name).bold(),
        format_bytes(size),
        handle.ino()
    );
    Ok(())
}
