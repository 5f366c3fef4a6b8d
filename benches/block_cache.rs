//! Benchmarks for block cache store/fetch and the caching directory read path

use blockcache::{
    BlockCache, BlockCacheConfig, BlockCacheKey, BlockDirectory, BlockDirectoryCache,
    DirectoryCacheConfig, IoContext, MemoryStorage, Storage, BLOCK_SIZE,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

fn cache(blocks: usize) -> BlockCache {
    BlockCache::new(&BlockCacheConfig::with_layout(4, blocks / 4, BLOCK_SIZE)).unwrap()
}

fn benchmark_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_cache_store");
    let block = vec![0xA5u8; BLOCK_SIZE];
    group.throughput(Throughput::Bytes(BLOCK_SIZE as u64));

    for blocks in [64, 1024].iter() {
        group.bench_with_input(BenchmarkId::new("overwrite", blocks), blocks, |b, &blocks| {
            let cache = cache(blocks);
            let key = BlockCacheKey::new(1, 0);
            cache.store(&key, 0, &block);
            b.iter(|| black_box(cache.store(black_box(&key), 0, &block)));
        });

        // Every store past capacity evicts
        group.bench_with_input(BenchmarkId::new("evicting", blocks), blocks, |b, &blocks| {
            let cache = cache(blocks);
            let mut next = 0u64;
            b.iter(|| {
                next += 1;
                black_box(cache.store(&BlockCacheKey::new(0, next), 0, &block))
            });
        });
    }

    group.finish();
}

fn benchmark_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_cache_fetch");
    let block = vec![0x5Au8; BLOCK_SIZE];
    group.throughput(Throughput::Bytes(BLOCK_SIZE as u64));

    let cache = cache(1024);
    for i in 0..512u64 {
        cache.store(&BlockCacheKey::new(0, i), 0, &block);
    }

    group.bench_function("hit", |b| {
        let mut out = vec![0u8; BLOCK_SIZE];
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 512;
            black_box(cache.fetch_block(&BlockCacheKey::new(0, i), &mut out))
        });
    });

    group.bench_function("miss", |b| {
        let mut out = vec![0u8; BLOCK_SIZE];
        b.iter(|| black_box(cache.fetch_block(&BlockCacheKey::new(9, 9), &mut out)));
    });

    group.finish();
}

fn benchmark_directory_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("block_directory_read");
    let len = 64 * BLOCK_SIZE;
    group.throughput(Throughput::Bytes(len as u64));

    let storage = MemoryStorage::new();
    storage.put_file("_0.fdt", &vec![7u8; len]);
    let directory_cache = Arc::new(BlockDirectoryCache::new(Arc::new(cache(128))).unwrap());
    let dir = BlockDirectory::new("bench", storage, directory_cache, DirectoryCacheConfig::default())
        .unwrap();

    group.bench_function("warm_sequential", |b| {
        let mut buf = vec![0u8; len];
        b.iter(|| {
            let mut input = dir.open_input("_0.fdt", IoContext::Default).unwrap();
            input.read_bytes(&mut buf).unwrap();
            black_box(&buf);
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_store, benchmark_fetch, benchmark_directory_read);
criterion_main!(benches);
