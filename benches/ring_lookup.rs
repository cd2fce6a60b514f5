//! Hash ring lookup benchmarks across fleet sizes.

use cachefleet::ring::{HashAlgorithm, HashRing};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn populated_ring(servers: u64, angles_per_server: usize) -> HashRing {
    let ring = HashRing::new(1 << 16, HashAlgorithm::Fnv1a32, 42);
    for id in 1..=servers {
        ring.add_server(id);
        ring.add_angle(id, angles_per_server).unwrap();
    }
    ring
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring/lookup");

    for size in [5u64, 50, 500] {
        let ring = populated_ring(size, 10);

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                i = i.wrapping_add(1);
                let key = format!("resource-{}", i);
                let _ = ring.find_server_id(black_box(&key));
            });
        });
    }

    group.finish();
}

fn bench_lookup_by_algorithm(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring/lookup_algorithm");

    for (name, algorithm) in [
        ("fnv1a32", HashAlgorithm::Fnv1a32),
        ("md5_low32", HashAlgorithm::Md5Low32),
    ] {
        let ring = HashRing::new(1 << 16, algorithm, 42);
        for id in 1..=50u64 {
            ring.add_server(id);
            ring.add_angle(id, 10).unwrap();
        }

        group.throughput(Throughput::Elements(1));
        group.bench_with_input(BenchmarkId::from_parameter(name), &name, |b, _| {
            b.iter(|| {
                let _ = ring.find_server_id(black_box("resource-12345"));
            });
        });
    }

    group.finish();
}

fn bench_reweight(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring/reweight");

    group.bench_function("add_remove_angle", |b| {
        let ring = populated_ring(50, 10);
        b.iter(|| {
            ring.add_angle(black_box(25), 3).unwrap();
            ring.remove_angle(black_box(25), 3);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_lookup, bench_lookup_by_algorithm, bench_reweight);
criterion_main!(benches);
