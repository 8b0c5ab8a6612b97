//! Read-only inspection: `ls`, `stat`, `segments`.

use std::path::Path;

use anyhow::{Context, Result};
use cdcfs_cas::{SegmentEntry, StoreStats};
use cdcfs_volume::FileMode;
use console::style;
use serde::Serialize;

use crate::units::{format_bytes, format_number};

pub fn ls(image: &Path) -> Result<()> {
    let fs = crate::open_image(image)?;
    let files = fs.volume().list()?;
    if files.is_empty() {
        println!("{}", style("(no files)").dim());
        return Ok(());
    }
    println!(
        "{:>5}  {:<8} {:>14} {:>9}  {}",
        style("INO").bold(),
        style("MODE").bold(),
        style("SIZE").bold(),
        style("SEGMENTS").bold(),
        style("NAME").bold()
    );
    for inode in files {
        let segments = inode
            .segment_list()
            .map(|meta| format_number(meta.count))
            .unwrap_or_else(|| "-".to_string());
        let mode = match inode.mode {
            FileMode::Chunked => style(inode.mode.as_str()).green(),
            _ => style(inode.mode.as_str()),
        };
        println!(
            "{:>5}  {:<8} {:>14} {:>9}  {}",
            inode.ino,
            mode,
            format_number(inode.size),
            segments,
            inode.name()
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct VolumeStatus {
    volume_id: String,
    block_size: u32,
    total_blocks: u64,
    inode_count: u32,
    files: usize,
    chunked_files: usize,
    data_start: u64,
    data_end: u64,
    free_blocks: u64,
    extra_superblock: Option<u64>,
    store: StoreStats,
}

pub fn stat(image: &Path, json: bool) -> Result<()> {
    let fs = crate::open_image(image)?;
    let sb = fs.volume().superblock();
    let files = fs.volume().list()?;
    let status = VolumeStatus {
        volume_id: format!("{:032x}", sb.volume_id),
        block_size: sb.block_size,
        total_blocks: sb.total_blocks,
        inode_count: sb.inode_count,
        files: files.len(),
        chunked_files: files.iter().filter(|i| i.mode == FileMode::Chunked).count(),
        data_start: sb.data_start,
        data_end: sb.data_end,
        free_blocks: fs.volume().free_blocks()?,
        extra_superblock: fs.volume().extra_superblock(),
        store: fs.stats().context("Failed to scan the chunk store")?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let bs = status.block_size as u64;
    let st = &status.store;
    println!("{}", style("Volume").bold().cyan());
    println!("  ID:            {}", status.volume_id);
    println!(
        "  Blocks:        {} x {} bytes ({})",
        format_number(status.total_blocks),
        status.block_size,
        format_bytes(status.total_blocks * bs)
    );
    println!(
        "  Files:         {} ({} chunked, {} inodes)",
        format_number(status.files as u64),
        format_number(status.chunked_files as u64),
        format_number(status.inode_count as u64)
    );
    println!(
        "  Data zone:     {} free of {}",
        format_bytes(status.free_blocks * bs),
        format_bytes((status.data_end - status.data_start) * bs)
    );
    println!();
    println!("{}", style("Chunk store").bold().cyan());
    println!(
        "  Hash table:    {} / {} buckets used",
        format_number(st.used_buckets),
        format_number(st.buckets)
    );
    println!(
        "  Chunks:        {} ({} payload)",
        format_number(st.chunks),
        format_bytes(st.payload_bytes)
    );
    println!("  Longest chain: {}", st.longest_chain);
    println!(
        "  Heap:          {} used, {} free",
        format_bytes(st.heap_used()),
        format_bytes(st.heap_free())
    );
    Ok(())
}

pub fn segments(image: &Path, name: &str, json: bool) -> Result<()> {
    let fs = crate::open_image(image)?;
    let handle = fs
        .volume()
        .lookup(name)
        .with_context(|| format!("No file named '{}'", name))?;
    let entries = fs.segments(handle)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!(
        "{:>6}  {:>14}  {:>14}  {:>8}",
        style("#").bold(),
        style("OFFSET").bold(),
        style("LOCATION").bold(),
        style("SIZE").bold()
    );
    let mut offset = 0u64;
    for (i, SegmentEntry { location, size }) in entries.iter().enumerate() {
        println!("{:>6}  {:>14}  {:>14}  {:>8}", i, offset, location, size);
        offset += size;
    }
    println!(
        "{} segments, {}",
        format_number(entries.len() as u64),
        format_bytes(offset)
    );
    Ok(())
}
