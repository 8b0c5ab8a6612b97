use std::io::Read;
use std::sync::Arc;
use std::time::Instant;

use cdcfs_cas::{CasError, ContentDigest, DedupFs, FsOptions};
use cdcfs_volume::MemoryDevice;
use rayon::prelude::*;

fn noise(len: usize, mut seed: u64) -> Vec<u8> {
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed as u8
        })
        .collect()
}

#[test]
fn stress_test_parallel_chunking() {
    const FILE_COUNT: usize = 24;

    let dev = Arc::new(MemoryDevice::new(1024, 16 * 1024).unwrap());
    let fs = DedupFs::format(dev, &FsOptions::default()).unwrap();

    // Half the files share one body, so dedup races between threads.
    let shared = noise(96 * 1024, 0xfeed);
    let mut expected = Vec::new();
    for i in 0..FILE_COUNT {
        let body = if i % 2 == 0 {
            noise(64 * 1024 + i * 333, i as u64 + 1)
        } else {
            shared.clone()
        };
        let handle = fs
            .volume()
            .create_file(&format!("file_{}.bin", i), &body)
            .unwrap();
        expected.push((handle, body));
    }

    let start = Instant::now();
    let reports: Vec<_> = expected
        .par_iter()
        .map(|(handle, _)| fs.chunk_file(*handle))
        .collect();
    println!("Chunked {} files in {:?}", FILE_COUNT, start.elapsed());

    for report in &reports {
        assert!(report.is_ok(), "{:?}", report);
    }

    for (handle, body) in &expected {
        let mut out = Vec::new();
        fs.reader(*handle).unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(&out, body);
    }

    // The shared body's chunks were inserted exactly once.
    let first_shared = fs.segments(expected[1].0).unwrap();
    for (handle, _) in expected.iter().skip(1).step_by(2) {
        assert_eq!(fs.segments(*handle).unwrap(), first_shared);
    }
    let stats = fs.stats().unwrap();
    let unique_shared: std::collections::HashSet<_> =
        first_shared.iter().map(|e| e.location).collect();
    let total_new: u64 = reports
        .iter()
        .map(|r| r.as_ref().map(|r| r.new_chunks).unwrap_or(0))
        .sum();
    assert_eq!(stats.chunks, total_new);
    assert!(unique_shared.len() as u64 <= stats.chunks);
}

#[test]
fn test_same_file_from_many_threads() {
    let dev = Arc::new(MemoryDevice::new(1024, 4096).unwrap());
    let fs = Arc::new(DedupFs::format(dev, &FsOptions::default()).unwrap());
    let data = noise(200 * 1024, 9);
    let handle = fs.volume().create_file("contended", &data).unwrap();

    let outcomes: Vec<_> = (0..8)
        .map(|_| {
            let fs = Arc::clone(&fs);
            std::thread::spawn(move || fs.chunk_file(handle))
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    let succeeded = outcomes.iter().filter(|r| r.is_ok()).count();
    assert_eq!(succeeded, 1);
    for outcome in outcomes.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            outcome,
            Err(CasError::Busy(_)) | Err(CasError::AlreadyChunked(_))
        ));
    }

    let mut out = Vec::new();
    fs.reader(handle).unwrap().read_to_end(&mut out).unwrap();
    assert_eq!(out, data);
}

#[test]
fn test_concurrent_store_inserts() {
    let dev = Arc::new(MemoryDevice::new(1024, 4096).unwrap());
    let fs = DedupFs::format(dev, &FsOptions::default()).unwrap();
    let store = fs.store();

    let payloads: Vec<Vec<u8>> = (0..64).map(|i| noise(1000 + i * 17, i as u64 + 100)).collect();
    let placed: Vec<_> = payloads
        .par_iter()
        .map(|p| store.lookup_or_insert(&ContentDigest::of(p), p).unwrap())
        .collect();

    let mut locations: Vec<_> = placed.iter().map(|p| p.location()).collect();
    locations.sort_unstable();
    locations.dedup();
    assert_eq!(locations.len(), payloads.len());

    for (placement, payload) in placed.iter().zip(&payloads) {
        let mut buf = vec![0u8; payload.len()];
        store.read_at(placement.location(), 0, &mut buf).unwrap();
        assert_eq!(&buf, payload);
    }
}
