use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use hyperchunk::{
    CacheConfig, ChunkCache, ChunkLayout, ChunkedVariable, MemoryChunkStore, Slice, SliceProjection,
};
use std::time::Duration;

fn lcg(mut s: u64) -> impl Iterator<Item = u64> {
    std::iter::from_fn(move || {
        s = s.wrapping_mul(6364136223846793005).wrapping_add(1);
        Some(s)
    })
}

fn grid(n: u64) -> impl Iterator<Item = Vec<u64>> {
    (0..n).flat_map(move |i| (0..n).map(move |j| vec![i, j]))
}

fn bench_cache_insert_10k(c: &mut Criterion) {
    c.bench_function("cache::insert_100x100", |b| {
        b.iter_batched(
            ChunkCache::new,
            |mut cache| {
                for coords in grid(100) {
                    cache.insert(coords, Vec::new()).unwrap();
                }
                black_box(cache)
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_cache_lookup_10k(c: &mut Criterion) {
    c.bench_function("cache::lookup_promote_10k_on_100x100", |b| {
        let mut cache = ChunkCache::new();
        for coords in grid(100) {
            cache.insert(coords, Vec::new()).unwrap();
        }
        let queries: Vec<[u64; 2]> = lcg(3)
            .take(10_000)
            .map(|x| [(x >> 8) % 100, (x >> 40) % 100])
            .collect();
        b.iter(|| {
            for q in &queries {
                black_box(cache.lookup(q));
            }
        })
    });
}

fn bench_projection(c: &mut Criterion) {
    c.bench_function("projection::touched_chunks_1000x1000_strided", |b| {
        let slices = [Slice::new(3, 997, 3), Slice::new(0, 1000, 7)];
        b.iter(|| {
            let p = SliceProjection::new(&[1000, 1000], &[32, 32], &slices).unwrap();
            black_box(p.touched_chunks().count())
        })
    });
}

fn bench_variable_io(c: &mut Criterion) {
    let layout = ChunkLayout::new(vec![512, 512], vec![64, 64], 4).unwrap();
    let whole = [Slice::whole(512), Slice::whole(512)];
    let data = vec![1u8; 512 * 512 * 4];

    c.bench_function("variable::write_whole_512x512", |b| {
        b.iter_batched(
            || ChunkedVariable::open(layout.clone(), CacheConfig::default(), MemoryChunkStore::new()).unwrap(),
            |mut v| {
                v.write_slice(&whole, &data).unwrap();
                black_box(v.flush().unwrap())
            },
            BatchSize::SmallInput,
        )
    });

    c.bench_function("variable::read_strided_columns_bounded_cache", |b| {
        let config = CacheConfig {
            max_chunks: Some(8),
            ..CacheConfig::default()
        };
        let mut v = ChunkedVariable::open(layout.clone(), config, MemoryChunkStore::new()).unwrap();
        v.write_slice(&whole, &data).unwrap();
        v.flush().unwrap();
        let sel = [Slice::whole(512), Slice::new(5, 512, 9)];
        b.iter(|| black_box(v.read_slice_vec(&sel).unwrap()))
    });
}

fn bench_config() -> Criterion {
    Criterion::default()
        .sample_size(12)
        .measurement_time(Duration::from_secs(5))
        .warm_up_time(Duration::from_secs(1))
}

criterion_group! {
    name = benches_cache;
    config = bench_config();
    targets = bench_cache_insert_10k, bench_cache_lookup_10k
}
criterion_group! {
    name = benches_io;
    config = bench_config();
    targets = bench_projection, bench_variable_io
}
criterion_main!(benches_cache, benches_io);
