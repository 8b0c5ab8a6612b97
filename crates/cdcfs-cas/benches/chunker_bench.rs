use std::sync::Arc;

use cdcfs_cas::{Chunker, ContentDigest, DedupFs, FsOptions};
use cdcfs_volume::MemoryDevice;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn noise(len: usize) -> Vec<u8> {
    let mut seed = 0x2545_f491_4f6c_dd1du64;
    (0..len)
        .map(|_| {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed as u8
        })
        .collect()
}

fn bench_boundaries(c: &mut Criterion) {
    let chunker = Chunker::default();
    let data = noise(4 * 1024 * 1024);

    let mut group = c.benchmark_group("chunker");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("boundaries_4mb", |b| {
        b.iter(|| chunker.chunks(black_box(&data)).count())
    });
    group.finish();
}

fn bench_store_insert(c: &mut Criterion) {
    let dev = Arc::new(MemoryDevice::new(4096, 8 * 1024).unwrap());
    let options = FsOptions {
        block_size: 4096,
        ..FsOptions::default()
    };
    let fs = DedupFs::format(dev, &options).unwrap();
    let chunk = noise(8 * 1024);
    let digest = ContentDigest::of(&chunk);
    fs.store().lookup_or_insert(&digest, &chunk).unwrap();

    let mut group = c.benchmark_group("store");
    group.throughput(Throughput::Bytes(chunk.len() as u64));
    // Repeated content exercises the verified dedup path.
    group.bench_function("dedup_hit_8kb", |b| {
        b.iter(|| fs.store().lookup_or_insert(black_box(&digest), black_box(&chunk)).unwrap())
    });
    group.bench_function("digest_8kb", |b| b.iter(|| ContentDigest::of(black_box(&chunk))));
    group.finish();
}

fn bench_chunk_file(c: &mut Criterion) {
    let data = noise(1024 * 1024);
    c.bench_function("chunk_file_1mb", |b| {
        b.iter_with_setup(
            || {
                let dev = Arc::new(MemoryDevice::new(1024, 8 * 1024).unwrap());
                let fs = DedupFs::format(dev, &FsOptions::default()).unwrap();
                let handle = fs.volume().create_file("bench", &data).unwrap();
                (fs, handle)
            },
            |(fs, handle)| fs.chunk_file(handle).unwrap(),
        )
    });
}

criterion_group!(benches, bench_boundaries, bench_store_insert, bench_chunk_file);
criterion_main!(benches);
