//! Benchmarks for request fingerprinting and cache lookups
//!
//! This benchmark measures:
//! - Canonical hashing of flat and nested parameter sets
//! - Memory cache hits keyed by fingerprint

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use std::time::Duration;

use comic_vine::client::{ListOptions, ResourceType, SortDirection};
use comic_vine::memory::{MemoryCacheConfig, MemoryCacheStore};
use comic_vine::{fingerprint, CacheStore, RequestKey};

fn nested_params(depth: usize) -> Value {
    let mut value = json!({"id": 4000, "name": "Amazing Fantasy", "tags": [3, 2, 1]});
    for level in 0..depth {
        value = json!({ format!("level{level}"): value, "z": level, "a": [level, level + 1] });
    }
    value
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");

    let list = ListOptions::new()
        .with_fields(["id", "name", "issue_number", "cover_date"])
        .with_limit(100)
        .with_offset(200)
        .sort_by("cover_date", SortDirection::Desc)
        .filter("volume", "4050-2127");
    let params = list.to_params();
    let endpoint = ResourceType::Issue.list_path();
    group.bench_function("list_request", |b| {
        b.iter(|| RequestKey::new(black_box(endpoint.as_str()), black_box(&params)))
    });

    for depth in [1usize, 4, 16] {
        let value = nested_params(depth);
        let size = serde_json::to_string(&value).map(|s| s.len()).unwrap_or(0);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("nested", depth), &value, |b, value| {
            b.iter(|| fingerprint(black_box("volumes/"), black_box(value)))
        });
    }
    group.finish();
}

fn bench_cache_hit(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let cache = rt.block_on(async {
        let cache = MemoryCacheStore::new(MemoryCacheConfig::default());
        for id in 0..1000 {
            let key = fingerprint(&ResourceType::Issue.detail_path(id), &json!({}));
            cache
                .set(&key, &json!({"id": id}), Duration::from_secs(3600))
                .await
                .unwrap();
        }
        cache
    });
    let key = fingerprint(&ResourceType::Issue.detail_path(500), &json!({}));

    c.bench_function("memory_cache_hit", |b| {
        b.to_async(&rt)
            .iter(|| async { cache.get(black_box(&key)).await.unwrap() })
    });
}

criterion_group!(benches, bench_fingerprint, bench_cache_hit);
criterion_main!(benches);
