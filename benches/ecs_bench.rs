#![allow(dead_code)]
//! Core storage benchmarks, with `hecs` alongside as a reference point.
//!
//! Run with: cargo bench
//!
//! Covers entity spawning, component lookup, despawning, archetype
//! segregation and query iteration.

use archetype_ecs::{IterMode, World as AaaWorld};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use hecs::World as HecsWorld;

#[derive(Debug, Copy, Clone)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Copy, Clone)]
struct Velocity {
    x: f32,
    y: f32,
    z: f32,
}

#[derive(Debug, Copy, Clone)]
struct Health(u32);

#[derive(Debug, Copy, Clone)]
struct Damage(f32);

fn bench_spawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");

    group.bench_function("aaa_spawn_1k_single_component", |b| {
        b.iter(|| {
            let mut world = AaaWorld::new();
            for i in 0..1_000 {
                let e = world.spawn();
                world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
            }
        });
    });
    group.bench_function("hecs_spawn_1k_single_component", |b| {
        b.iter(|| {
            let mut world = HecsWorld::new();
            for i in 0..1_000 {
                world.spawn((Position { x: i as f32, y: 0.0, z: 0.0 },));
            }
        });
    });

    group.bench_function("aaa_spawn_1k_two_components", |b| {
        b.iter(|| {
            let mut world = AaaWorld::new();
            for i in 0..1_000 {
                let e = world.spawn();
                world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
            }
        });
    });
    group.bench_function("hecs_spawn_1k_two_components", |b| {
        b.iter(|| {
            let mut world = HecsWorld::new();
            for i in 0..1_000 {
                world.spawn((
                    Position { x: i as f32, y: 0.0, z: 0.0 },
                    Velocity { x: 1.0, y: 0.0, z: 0.0 },
                ));
            }
        });
    });

    group.bench_function("aaa_spawn_1k_three_components", |b| {
        b.iter(|| {
            let mut world = AaaWorld::new();
            for i in 0..1_000 {
                let e = world.spawn();
                world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Health(100)).unwrap();
            }
        });
    });
    group.bench_function("hecs_spawn_1k_three_components", |b| {
        b.iter(|| {
            let mut world = HecsWorld::new();
            for i in 0..1_000 {
                world.spawn((
                    Position { x: i as f32, y: 0.0, z: 0.0 },
                    Velocity { x: 1.0, y: 0.0, z: 0.0 },
                    Health(100),
                ));
            }
        });
    });

    group.bench_function("aaa_spawn_1k_four_components", |b| {
        b.iter(|| {
            let mut world = AaaWorld::new();
            for i in 0..1_000 {
                let e = world.spawn();
                world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Health(100)).unwrap();
                world.set(e, Damage(10.5)).unwrap();
            }
        });
    });
    group.bench_function("hecs_spawn_1k_four_components", |b| {
        b.iter(|| {
            let mut world = HecsWorld::new();
            for i in 0..1_000 {
                world.spawn((
                    Position { x: i as f32, y: 0.0, z: 0.0 },
                    Velocity { x: 1.0, y: 0.0, z: 0.0 },
                    Health(100),
                    Damage(10.5),
                ));
            }
        });
    });

    group.finish();
}

fn bench_spawn_large(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_large");

    for count in [1_000, 10_000, 100_000].iter() {
        group.bench_with_input(
            BenchmarkId::new("aaa_spawn_with_3_components", count),
            count,
            |b, &count| {
                b.iter(|| {
                    let mut world = AaaWorld::new();
                    for i in 0..count {
                        let e = world.spawn();
                        world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                        world.set(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
                        world.set(e, Health(100)).unwrap();
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("hecs_spawn_with_3_components", count),
            count,
            |b, &count| {
                b.iter(|| {
                    let mut world = HecsWorld::new();
                    for i in 0..count {
                        world.spawn((
                            Position { x: i as f32, y: 0.0, z: 0.0 },
                            Velocity { x: 1.0, y: 0.0, z: 0.0 },
                            Health(100),
                        ));
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for count in [1_000, 10_000, 100_000].iter() {
        group.bench_with_input(
            BenchmarkId::new("aaa_lookup_entities", count),
            count,
            |b, &count| {
                let mut world = AaaWorld::new();
                let entities: Vec<_> = (0..count)
                    .map(|i| {
                        let e = world.spawn();
                        world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                        world.set(e, Health(100)).unwrap();
                        e
                    })
                    .collect();

                b.iter(|| {
                    for &entity in &entities {
                        black_box(world.get::<Position>(entity).ok());
                    }
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("hecs_lookup_entities", count),
            count,
            |b, &count| {
                let mut world = HecsWorld::new();
                let entities: Vec<_> = (0..count)
                    .map(|i| world.spawn((Position { x: i as f32, y: 0.0, z: 0.0 }, Health(100))))
                    .collect();

                b.iter(|| {
                    for &entity in &entities {
                        black_box(world.get::<&Position>(entity).ok());
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_despawn(c: &mut Criterion) {
    let mut group = c.benchmark_group("despawn");

    group.bench_function("aaa_despawn_1k_entities", |b| {
        b.iter_batched(
            || {
                let mut world = AaaWorld::new();
                let entities: Vec<_> = (0..1_000)
                    .map(|i| {
                        let e = world.spawn();
                        world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                        world.set(e, Health(100)).unwrap();
                        e
                    })
                    .collect();
                (world, entities)
            },
            |(mut world, entities)| {
                for entity in entities {
                    let _ = world.despawn(entity);
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.bench_function("hecs_despawn_1k_entities", |b| {
        b.iter_batched(
            || {
                let mut world = HecsWorld::new();
                let entities: Vec<_> = (0..1_000)
                    .map(|i| world.spawn((Position { x: i as f32, y: 0.0, z: 0.0 }, Health(100))))
                    .collect();
                (world, entities)
            },
            |(mut world, entities)| {
                for entity in entities {
                    let _ = world.despawn(entity);
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

fn bench_archetype_segregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("archetype");

    group.bench_function("aaa_archetype_segregation_1k", |b| {
        b.iter(|| {
            let mut world = AaaWorld::new();

            for i in 0..250 {
                let e = world.spawn();
                world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
            }
            for i in 0..250 {
                let e = world.spawn();
                world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Health(100)).unwrap();
            }
            for i in 0..250 {
                let e = world.spawn();
                world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
                world.set(e, Health(100)).unwrap();
            }
            for i in 0..250 {
                let e = world.spawn();
                world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
            }
        });
    });

    group.bench_function("hecs_archetype_segregation_1k", |b| {
        b.iter(|| {
            let mut world = HecsWorld::new();

            for i in 0..250 {
                world.spawn((
                    Position { x: i as f32, y: 0.0, z: 0.0 },
                    Velocity { x: 1.0, y: 0.0, z: 0.0 },
                ));
            }
            for i in 0..250 {
                world.spawn((Position { x: i as f32, y: 0.0, z: 0.0 }, Health(100)));
            }
            for i in 0..250 {
                world.spawn((
                    Position { x: i as f32, y: 0.0, z: 0.0 },
                    Velocity { x: 1.0, y: 0.0, z: 0.0 },
                    Health(100),
                ));
            }
            for i in 0..250 {
                world.spawn((Position { x: i as f32, y: 0.0, z: 0.0 },));
            }
        });
    });

    group.finish();
}

fn bench_query_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    group.bench_function("aaa_query_compile_10k", |b| {
        let mut world = AaaWorld::new();
        for i in 0..10_000 {
            let e = world.spawn();
            world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
            world.set(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
            world.set(e, Health(100)).unwrap();
        }

        b.iter(|| {
            black_box(world.compile_query("Position, Velocity").unwrap());
        });
    });

    group.bench_function("aaa_query_iteration_cached_100k", |b| {
        let mut world = AaaWorld::new();
        for i in 0..100_000 {
            let e = world.spawn();
            world.set(e, Position { x: i as f32, y: 0.0, z: 0.0 }).unwrap();
            world.set(e, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
            world.set(e, Health(100)).unwrap();
        }

        let plan = world.compile_query("Position, Velocity").unwrap();
        // warm the query cache before measuring steady-state iteration.
        let _ = world.query_archetypes(&plan);

        b.iter(|| {
            world.for_each::<Position>(&plan, IterMode::EnabledOnly, |_e, pos| {
                pos.x += 1.0;
            });
        });
    });

    group.bench_function("hecs_query_state_creation_10k", |b| {
        let mut world = HecsWorld::new();
        for i in 0..10_000 {
            world.spawn((
                Position { x: i as f32, y: 0.0, z: 0.0 },
                Velocity { x: 1.0, y: 0.0, z: 0.0 },
                Health(100),
            ));
        }

        b.iter(|| {
            world.query::<(&Position, &Velocity)>().iter().count();
        });
    });

    group.bench_function("hecs_query_iteration_10k", |b| {
        let mut world = HecsWorld::new();
        for i in 0..10_000 {
            world.spawn((
                Position { x: i as f32, y: 0.0, z: 0.0 },
                Velocity { x: 1.0, y: 0.0, z: 0.0 },
                Health(100),
            ));
        }

        let mut query = world.query::<(&Position, &Velocity)>();

        b.iter(|| {
            let mut count = 0;
            for _ in query.iter() {
                count += 1;
            }
            black_box(count);
        });
    });

    group.finish();
}

fn bench_duplicate(c: &mut Criterion) {
    let mut group = c.benchmark_group("duplicate");

    group.bench_function("aaa_duplicate_1k", |b| {
        b.iter_batched(
            || {
                let mut world = AaaWorld::new();
                let source = world.spawn();
                world.set(source, Position { x: 1.0, y: 2.0, z: 3.0 }).unwrap();
                world.set(source, Velocity { x: 1.0, y: 0.0, z: 0.0 }).unwrap();
                (world, source)
            },
            |(mut world, source)| {
                for _ in 0..1_000 {
                    black_box(world.duplicate(source).unwrap());
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_spawn,
    bench_spawn_large,
    bench_lookup,
    bench_despawn,
    bench_archetype_segregation,
    bench_query_creation,
    bench_duplicate,
);

criterion_main!(benches);
