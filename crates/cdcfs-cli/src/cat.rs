//! `cdcfs cat`: stream a file (plain or chunked) to stdout.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use crate::units::parse_size;

#[derive(Args, Debug)]
pub struct CatArgs {
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    #[arg(value_name = "NAME")]
    name: String,

    /// Start reading at this byte offset
    #[arg(long, value_parser = parse_size, default_value = "0")]
    offset: u64,

    /// Copy at most this many bytes
    #[arg(long, value_parser = parse_size)]
    length: Option<u64>,
}

pub fn run(args: CatArgs) -> Result<()> {
    let fs = crate::open_image(&args.image)?;
    let handle = fs
        .volume()
        .lookup(&args.name)
        .with_context(|| format!("No file named '{}'", args.name))?;

    let mut reader = fs.reader(handle)?;
    reader.seek(SeekFrom::Start(args.offset))?;
    let mut source = reader.take(args.length.unwrap_or(u64::MAX));

    let stdout = io::stdout();
    let mut out = stdout.lock();
    match io::copy(&mut source, &mut out) {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(e) => return Err(e).context("Failed to copy file contents"),
    }
    out.flush()?;
    Ok(())
}
