#![allow(dead_code)]

use archetype_ecs::World;
use criterion::{black_box, criterion_group, criterion_main, Criterion};

#[derive(Debug, Clone)]
struct Position(f32, f32, f32);

#[derive(Debug, Clone)]
struct Velocity(f32, f32, f32);

#[derive(Debug, Clone)]
struct Health(u32);

fn spawn_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_bench");

    group.bench_function("spawn_2_components", |b| {
        let mut world = World::new();
        b.iter(|| {
            for _ in 0..1000 {
                let e = world.spawn();
                world.set(e, Position(1.0, 2.0, 3.0)).unwrap();
                world.set(e, Velocity(1.0, 0.0, 0.0)).unwrap();
                black_box(e);
            }
        });
    });

    group.bench_function("spawn_3_components", |b| {
        let mut world = World::new();
        b.iter(|| {
            for _ in 0..1000 {
                let e = world.spawn();
                world.set(e, Position(1.0, 2.0, 3.0)).unwrap();
                world.set(e, Velocity(1.0, 0.0, 0.0)).unwrap();
                world.set(e, Health(100)).unwrap();
                black_box(e);
            }
        });
    });

    group.bench_function("spawn_mixed", |b| {
        let mut world = World::new();
        b.iter(|| {
            for i in 0..1000 {
                let e = world.spawn();
                world.set(e, Position(1.0, 2.0, 3.0)).unwrap();
                world.set(e, Velocity(1.0, 0.0, 0.0)).unwrap();
                if i % 2 != 0 {
                    world.set(e, Health(100)).unwrap();
                }
                black_box(e);
            }
        });
    });

    group.finish();
}

criterion_group!(benches, spawn_benchmark);
criterion_main!(benches);
