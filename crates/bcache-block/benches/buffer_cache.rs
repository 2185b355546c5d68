#![forbid(unsafe_code)]

use bcache_block::{BlockDevice, BufferCache, ByteBlockDevice, DeviceTable, MemByteDevice};
use bcache_types::{BlockNumber, BlockSize, CacheConfig, DeviceId};
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use std::sync::{Arc, Barrier};
use std::thread;

const DEV: DeviceId = DeviceId(1);
const BLOCK_SIZE: u32 = 4096;
const DEVICE_BLOCKS: u64 = 256;

fn make_cache(slot_count: u32, shard_count: u32) -> BufferCache<DeviceTable> {
    let bs = BlockSize::new(BLOCK_SIZE).expect("block size");
    let table = DeviceTable::new(bs);
    let mem = MemByteDevice::new(usize::try_from(DEVICE_BLOCKS).expect("fits") * bs.bytes());
    let device: Arc<dyn BlockDevice> = Arc::new(ByteBlockDevice::new(mem, bs).expect("device"));
    table.attach(DEV, device).expect("attach");
    let config = CacheConfig {
        slot_count,
        shard_count,
        block_size: BLOCK_SIZE,
    };
    BufferCache::from_config(&config, table).expect("cache")
}

// ── Benchmarks ──────────────────────────────────────────────────────────

fn bench_hit(c: &mut Criterion) {
    let cache = make_cache(30, 13);
    let warm = cache.bread(DEV, BlockNumber(0)).expect("warmup");
    cache.release(warm).expect("release");

    c.bench_function("buffer_cache_hit_4k", |b| {
        b.iter(|| {
            let handle = cache.bread(DEV, black_box(BlockNumber(0))).expect("hit");
            cache.release(handle).expect("release");
        });
    });
}

fn bench_local_eviction(c: &mut Criterion) {
    // One shard: every distinct block reuses the LRU slot in place.
    let cache = make_cache(8, 1);

    let mut block_id = 0_u64;
    c.bench_function("buffer_cache_local_evict_4k", |b| {
        b.iter(|| {
            let handle = cache
                .bread(DEV, black_box(BlockNumber(block_id % DEVICE_BLOCKS)))
                .expect("miss");
            cache.release(handle).expect("release");
            block_id += 1;
        });
    });
}

fn bench_steal(c: &mut Criterion) {
    // Shard 0 holds slots 0 and 2, shard 1 holds slot 1. Pinning blocks 0
    // and 1 leaves one free slot, which alternating parity bounces between
    // the shards on every acquire.
    let cache = make_cache(3, 2);
    let pins: Vec<_> = [0_u64, 1]
        .iter()
        .map(|&block| {
            let handle = cache.acquire(DEV, BlockNumber(block)).expect("pin target");
            let pin = cache.pin(&handle).expect("pin");
            cache.release(handle).expect("release");
            pin
        })
        .collect();

    let mut iter = 0_u64;
    c.bench_function("buffer_cache_steal_4k", |b| {
        b.iter(|| {
            let block = BlockNumber(2 + iter % (DEVICE_BLOCKS - 2));
            let handle = cache.acquire(DEV, black_box(block)).expect("steal");
            cache.release(handle).expect("release");
            iter += 1;
        });
    });

    for pin in pins {
        cache.unpin(pin).expect("unpin");
    }
}

fn bench_contended_hits(c: &mut Criterion) {
    const THREADS: usize = 4;
    const OPS: u64 = 1_000;
    let cache = Arc::new(make_cache(32, 8));

    c.bench_function("buffer_cache_contended_4_threads", |b| {
        b.iter(|| {
            let barrier = Arc::new(Barrier::new(THREADS));
            let workers: Vec<_> = (0..THREADS as u64)
                .map(|tid| {
                    let cache = Arc::clone(&cache);
                    let barrier = Arc::clone(&barrier);
                    thread::spawn(move || {
                        barrier.wait();
                        for op in 0..OPS {
                            let block = BlockNumber((op * THREADS as u64 + tid) % 24);
                            let handle = cache.bread(DEV, block).expect("read");
                            cache.release(handle).expect("release");
                        }
                    })
                })
                .collect();
            for worker in workers {
                worker.join().expect("worker");
            }
        });
    });
}

fn bench_metrics_snapshot(c: &mut Criterion) {
    let cache = make_cache(30, 13);
    for i in 0..16_u64 {
        let handle = cache.bread(DEV, BlockNumber(i)).expect("warmup");
        cache.release(handle).expect("release");
    }

    c.bench_function("buffer_cache_metrics_snapshot", |b| {
        b.iter(|| {
            let _m = black_box(cache.metrics());
        });
    });
}

criterion_group!(
    cache_benches,
    bench_hit,
    bench_local_eviction,
    bench_steal,
    bench_contended_hits,
    bench_metrics_snapshot,
);
criterion_main!(cache_benches);
