//! `cdcfs mkfs`: create and format a volume image.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use cdcfs_cas::DedupFs;
use cdcfs_config::log_cli_info;
use clap::Args;
use console::style;

use crate::units::{format_bytes, format_number, parse_size};

#[derive(Args, Debug)]
pub struct MkfsArgs {
    /// Image file to create (overwritten if it exists)
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Image size, e.g. 64M or 1G
    #[arg(short, long, value_parser = parse_size)]
    size: u64,

    /// Block size in bytes (power of two, 512..=65536)
    #[arg(long)]
    block_size: Option<u32>,

    /// Chunk-store hash table size, e.g. 32K
    #[arg(long, value_parser = parse_size)]
    hashtable_size: Option<u64>,

    /// Share of the image reserved for the chunk heap
    #[arg(long)]
    heap_percent: Option<u8>,

    /// Number of inodes
    #[arg(long)]
    inodes: Option<u32>,
}

pub fn run(args: MkfsArgs) -> Result<()> {
    let mut options = crate::options()?;
    if let Some(bs) = args.block_size {
        options.block_size = bs as usize;
    }
    if let Some(size) = args.hashtable_size {
        options.hashtable_size =
            u32::try_from(size).context("Hash table size must fit in 32 bits")?;
    }
    if let Some(percent) = args.heap_percent {
        if percent == 0 || percent >= 100 {
            bail!("--heap-percent must be between 1 and 99");
        }
        options.format.heap_percent = percent;
    }
    if let Some(inodes) = args.inodes {
        options.format.inode_count = inodes;
    }
    if args.size < options.block_size as u64 {
        bail!(
            "Image size {} is smaller than one {}-byte block",
            args.size,
            options.block_size
        );
    }

    let fs = DedupFs::create_image(&args.image, args.size, &options)
        .with_context(|| format!("Failed to format {}", args.image.display()))?;
    let sb = fs.volume().superblock();
    let stats = fs.stats()?;
    log_cli_info!("Image created", blocks = sb.total_blocks, block_size = sb.block_size);

    println!(
        "{} {}",
        style("Formatted").green().bold(),
        style(args.image.display()).bold()
    );
    println!(
        "  Blocks:      {} x {} bytes",
        format_number(sb.total_blocks),
        sb.block_size
    );
    println!("  Inodes:      {}", format_number(sb.inode_count as u64));
    println!(
        "  Data zone:   {}",
        format_bytes((sb.data_end - sb.data_start) * sb.block_size as u64)
    );
    println!(
        "  Hash table:  {} buckets",
        format_number(stats.buckets)
    );
    println!("  Chunk heap:  {}", format_bytes(stats.heap_free()));
    Ok(())
}
