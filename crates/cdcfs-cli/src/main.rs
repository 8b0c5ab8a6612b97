//! # cdcfs CLI
//!
//! Command-line interface for cdcfs deduplicating volume images.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cdcfs_cas::{DedupFs, FsOptions};
use cdcfs_config::logging::{init_logging, LogLevel};

mod cat;
mod chunk;
mod inspect;
mod mkfs;
mod put;
mod units;

/// cdcfs - content-defined chunking and deduplication on a block image
#[derive(Parser)]
#[command(name = "cdcfs")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and format a volume image
    Mkfs(mkfs::MkfsArgs),

    /// Import a host file as a plain file
    Put(put::PutArgs),

    /// Replace plain files with deduplicated segment lists
    Chunk(chunk::ChunkArgs),

    /// Write a file's contents to stdout
    Cat(cat::CatArgs),

    /// List files on a volume
    Ls {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,
    },

    /// Show superblock and chunk-store statistics
    Stat {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Dump the segment list of a chunked file
    Segments {
        #[arg(value_name = "IMAGE")]
        image: PathBuf,

        #[arg(value_name = "NAME")]
        name: String,

        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(LogLevel::from_verbosity(cli.verbose));

    match cli.command {
        Commands::Mkfs(args) => mkfs::run(args),
        Commands::Put(args) => put::run(args),
        Commands::Chunk(args) => chunk::run(args),
        Commands::Cat(args) => cat::run(args),
        Commands::Ls { image } => inspect::ls(&image),
        Commands::Stat { image, json } => inspect::stat(&image, json),
        Commands::Segments { image, name, json } => inspect::segments(&image, &name, json),
        Commands::Config => {
            print!("{}", cdcfs_config::config().to_toml());
            Ok(())
        }
    }
}

/// Options from the layered configuration
pub(crate) fn options() -> Result<FsOptions> {
    let config = cdcfs_config::config();
    FsOptions::from_config(&config).context("Invalid chunking configuration")
}

/// Open an existing image with the configured runtime options
pub(crate) fn open_image(image: &std::path::Path) -> Result<DedupFs> {
    DedupFs::open_image(image, &options()?)
        .with_context(|| format!("Failed to open volume image {}", image.display()))
}
