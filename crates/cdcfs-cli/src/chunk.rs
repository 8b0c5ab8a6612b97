//! `cdcfs chunk`: run the chunking pipeline on named files.
//!
//! Files are independent, so several are chunked at once on a rayon pool.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use cdcfs_cas::{ChunkReport, DedupFs};
use cdcfs_config::{log_cli_debug, log_cli_info};
use clap::Args;
use console::{style, Emoji};
use indicatif::{ParallelProgressIterator, ProgressBar, ProgressStyle};
use rayon::prelude::*;

use crate::units::{format_bytes, format_number};

static CHECK: Emoji<'_, '_> = Emoji("✔ ", "[ok] ");
static CROSS: Emoji<'_, '_> = Emoji("✘ ", "[!!] ");

#[derive(Args, Debug)]
pub struct ChunkArgs {
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    /// Files to convert
    #[arg(value_name = "NAME", required = true)]
    names: Vec<String>,

    /// Worker threads (default: config `ingest.threads`, else one per CPU)
    #[arg(short = 'j', long)]
    threads: Option<usize>,
}

pub fn run(args: ChunkArgs) -> Result<()> {
    let fs = crate::open_image(&args.image)?;
    let threads = args
        .threads
        .or(cdcfs_config::config().ingest.threads)
        .unwrap_or(0);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("cdcfs-chunk-{}", i))
        .build()
        .context("Failed to create chunking thread pool")?;
    log_cli_debug!("Chunking", files = args.names.len(), threads = pool.current_num_threads());

    let pb = ProgressBar::new(args.names.len() as u64);
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );

    let results: Vec<(String, Result<ChunkReport>)> = pool.install(|| {
        args.names
            .par_iter()
            .progress_with(pb.clone())
            .map(|name| (name.clone(), chunk_one(&fs, name)))
            .collect()
    });
    pb.finish_and_clear();

    let mut failed = 0usize;
    let mut stored = 0u64;
    let mut total = 0u64;
    for (name, result) in &results {
        match result {
            Ok(report) => {
                stored += report.bytes_stored;
                total += report.bytes_total;
                println!(
                    "  {}{}: {} segments, {} new, {} deduplicated, {} stored of {}",
                    CHECK,
                    style(name).bold(),
                    format_number(report.segments),
                    format_number(report.new_chunks),
                    format_number(report.deduplicated_chunks),
                    format_bytes(report.bytes_stored),
                    format_bytes(report.bytes_total),
                );
            }
            Err(e) => {
                failed += 1;
                eprintln!("  {}{}: {:#}", CROSS, style(name).bold(), style(e).red());
            }
        }
    }

    log_cli_info!("Chunk run finished", files = results.len(), failed = failed);
    if results.len() > 1 {
        println!(
            "{} {} of {} stored ({} files)",
            style("Total:").bold(),
            format_bytes(stored),
            format_bytes(total),
            results.len() - failed
        );
    }
    if failed > 0 {
        bail!("{} of {} files failed to chunk", failed, results.len());
    }
    Ok(())
}

fn chunk_one(fs: &DedupFs, name: &str) -> Result<ChunkReport> {
    let handle = fs.volume().lookup(name)?;
    Ok(fs.chunk_file(handle)?)
}
