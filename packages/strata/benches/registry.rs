use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use strata::join::{join2, join2_mut, JoinCache};
use strata::{component, Registry, SnapshotManager};

#[derive(Debug, Clone, Copy, Default)]
pub struct Position(f32, f32, f32);
component!(Position);

#[derive(Debug, Clone, Copy, Default)]
pub struct Velocity(f32, f32, f32);
component!(Velocity);

const ENTITY_COUNT: usize = 100_000;

fn populated(count: usize) -> Registry {
    let mut registry = Registry::new();
    for i in 0..count {
        let e = registry.create();
        let f = i as f32;
        registry.add(e, Position(f, f, f));
        if i % 2 == 0 {
            registry.add(e, Velocity(0.1, 0.2, 0.3));
        }
    }
    registry
}

fn bench_create_destroy(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_destroy");

    for count in [1_000, 10_000, ENTITY_COUNT] {
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let mut registry = Registry::new();
            let mut entities = Vec::with_capacity(count);
            b.iter(|| {
                for _ in 0..count {
                    entities.push(registry.create());
                }
                for e in entities.drain(..) {
                    registry.destroy(e);
                }
                black_box(registry.alive_count())
            });
        });
    }

    group.finish();
}

fn bench_join(c: &mut Criterion) {
    let registry = populated(ENTITY_COUNT);

    c.bench_function("join2_read", |b| {
        b.iter(|| {
            let mut sum = 0.0;
            join2::<Position, Velocity>(&registry, |_, p, v| sum += p.0 * v.0);
            black_box(sum)
        });
    });

    c.bench_function("join2_write", |b| {
        b.iter(|| {
            join2_mut::<Position, Velocity>(&registry, |_, p, v| {
                p.0 += v.0;
                p.1 += v.1;
                p.2 += v.2;
            })
        });
    });

    let mut cache = JoinCache::new();
    c.bench_function("join2_cached", |b| {
        b.iter(|| cache.join2::<Position, Velocity>(1, &registry, |_, p, _| {
            black_box(p);
        }));
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let mut registry = populated(ENTITY_COUNT);
    let mut manager = SnapshotManager::new(16);

    c.bench_function("record_full_frame", |b| {
        b.iter(|| manager.record_frame(&mut registry, false));
    });

    let snapshot = manager.create_snapshot(&registry, false);
    c.bench_function("load_full_frame", |b| {
        b.iter(|| manager.load_snapshot(&mut registry, &snapshot));
    });
}

criterion_group!(benches, bench_create_destroy, bench_join, bench_snapshot);
criterion_main!(benches);
