//! Benchmark for the target registry
//!
//! Covers the per-target work of a session: allocation, re-identification
//! from the previous list, and address lookup.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sas_topology::{LinkRate, Listing, PortId, SasAddress, TargetRegistry, TransportKind};

const PORT: PortId = PortId(0);

fn populated(count: u64, listing: Listing) -> TargetRegistry {
    let mut registry = TargetRegistry::with_capacity(count as usize * 2);
    for i in 0..count {
        let handle = registry
            .allocate(PORT, SasAddress(0x5000_0000_0000_0000 + i), LinkRate::G6, TransportKind::ScsiTransport)
            .unwrap();
        registry.set_listing(handle, listing).unwrap();
    }
    registry
}

fn bench_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("target_registry");
    group.throughput(Throughput::Elements(1));

    group.bench_function("allocate_release", |b| {
        let mut registry = TargetRegistry::new();
        let mut counter = 0u64;
        b.iter(|| {
            counter += 1;
            let handle = registry
                .allocate(PORT, black_box(SasAddress(counter)), LinkRate::G6, TransportKind::ScsiTransport)
                .unwrap();
            registry.release(handle);
        });
    });

    group.finish();
}

fn bench_reidentify(c: &mut Criterion) {
    let mut group = c.benchmark_group("target_registry");

    for size in [64u64, 512, 1024] {
        group.throughput(Throughput::Elements(size));
        group.bench_with_input(BenchmarkId::new("reidentify_session", size), &size, |b, &size| {
            let mut registry = populated(size, Listing::Committed);
            b.iter(|| {
                registry.splice(PORT, Listing::Committed, Listing::Previous);
                for i in 0..size {
                    let (handle, _) = registry
                        .acquire(PORT, SasAddress(0x5000_0000_0000_0000 + i), LinkRate::G6, TransportKind::ScsiTransport)
                        .unwrap();
                    registry.set_listing(handle, Listing::Committed).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("target_registry");
    group.throughput(Throughput::Elements(1));

    let registry = populated(1024, Listing::Current);
    group.bench_function("find_by_address", |b| {
        let mut counter = 0u64;
        b.iter(|| {
            counter = (counter + 7) % 1024;
            black_box(registry.find(PORT, Listing::Current, SasAddress(0x5000_0000_0000_0000 + counter)));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_allocate_release, bench_reidentify, bench_lookup);
criterion_main!(benches);
