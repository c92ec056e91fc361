use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde_json::json;
use std::time::Duration;
use tierweave::{
    CompressionEngine, MemoryValue, Namespace, SearchOptions, SearchQuery, Tier, Weave, WeaveConfig,
};
use tokio::runtime::Runtime;

fn ns() -> Namespace {
    "bench/research/notes".parse().unwrap()
}

fn open_weave(rt: &Runtime) -> Weave {
    rt.block_on(async { Weave::in_memory().await.unwrap() })
}

/// Benchmark: Engine assembly
fn bench_open(c: &mut Criterion) {
    c.bench_function("weave_open", |b| {
        b.to_async(Runtime::new().unwrap())
            .iter(|| async { black_box(Weave::open(WeaveConfig::default()).await.unwrap()) })
    });
}

/// Benchmark: Single put, appending a revision to the same key
fn bench_put_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let weave = open_weave(&rt);

    c.bench_function("put_single", |b| {
        b.iter(|| {
            black_box(
                weave
                    .put(
                        &ns(),
                        Tier::Working,
                        "p1",
                        json!({
                            "persona": "designer",
                            "quote": "pricing is confusing"
                        }),
                    )
                    .unwrap(),
            )
        })
    });
}

/// Benchmark: Sequential puts to different keys
fn bench_put_sequential(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_sequential");
    let rt = Runtime::new().unwrap();

    for size in [10, 100, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let weave = open_weave(&rt);
                for i in 0..size {
                    weave
                        .put(&ns(), Tier::Working, &format!("key{}", i), json!({"id": i}))
                        .unwrap();
                }
            });
        });
    }
    group.finish();
}

/// Benchmark: Cached read vs. a read that misses the cache
fn bench_get(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let weave = open_weave(&rt);
    weave
        .put(&ns(), Tier::Working, "p1", json!({"quote": "setup was fast"}))
        .unwrap();

    let mut group = c.benchmark_group("get");
    group.bench_function("cache_hit", |b| {
        b.iter(|| black_box(weave.cache().get(&ns(), Tier::Working, "p1").unwrap()))
    });
    group.bench_function("store", |b| {
        b.iter(|| black_box(weave.store().get(&ns(), Tier::Working, "p1").unwrap()))
    });
    group.finish();
}

/// Benchmark: Compression of payloads around and above the threshold
fn bench_compression(c: &mut Criterion) {
    let engine = CompressionEngine::default();
    let mut group = c.benchmark_group("compression");

    for size in [1024usize, 16 * 1024, 256 * 1024] {
        let data = "pricing is confusing ".repeat(size / 21).into_bytes();
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::new("compress", size), &data, |b, data| {
            b.iter(|| black_box(engine.compress(data, data.len()).unwrap()))
        });
        let (algorithm, packed) = engine.compress(&data, data.len()).unwrap();
        group.bench_with_input(BenchmarkId::new("decompress", size), &packed, |b, packed| {
            b.iter(|| black_box(engine.decompress(algorithm, packed).unwrap()))
        });
    }
    group.finish();
}

/// Benchmark: Full-text search over a populated namespace
fn bench_search(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let weave = open_weave(&rt);
    for i in 0..500 {
        let quote = if i % 10 == 0 { "pricing is confusing" } else { "setup was fast" };
        weave
            .put(&ns(), Tier::Working, &format!("p{}", i), json!({"quote": quote, "n": i}))
            .unwrap();
    }
    let query = SearchQuery::text("pricing");
    let options = SearchOptions::default();

    c.bench_function("search_text_500", |b| {
        b.to_async(Runtime::new().unwrap())
            .iter(|| async { black_box(weave.search(&query, &options).await.unwrap()) })
    });
}

/// Benchmark: Reading a large value back through decompression
fn bench_large_value(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let weave = open_weave(&rt);
    let transcript = MemoryValue::structured(json!({"transcript": "hello ".repeat(20_000)}));
    weave.put(&ns(), Tier::LongTerm, "t1", transcript).unwrap();

    c.bench_function("get_large_compressed", |b| {
        b.iter(|| black_box(weave.store().get(&ns(), Tier::LongTerm, "t1").unwrap()))
    });
}

fn configure_criterion() -> Criterion {
    Criterion::default()
        .warm_up_time(Duration::from_secs(1))
        .measurement_time(Duration::from_secs(3))
        .sample_size(50)
}

criterion_group! {
    name = benches;
    config = configure_criterion();
    targets = bench_open,
        bench_put_single,
        bench_put_sequential,
        bench_get,
        bench_compression,
        bench_search,
        bench_large_value
}

criterion_main!(benches);
