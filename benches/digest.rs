//! Benchmark: digest and broadcast cost on wide scope trees.
//!
//! Compares:
//! - a clean digest over trees of growing size
//! - a digest where a root value every watcher reads changes
//! - broadcast to a single listener, with and without subtree pruning

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use scope_flow::{Event, Scope, Value};
use std::hint::black_box;

/// Build a root with `width` children, each holding `depth` nested scopes and
/// one watcher per scope.
fn build_tree(width: usize, depth: usize) -> (Scope, Scope) {
    let root = Scope::new_root();
    root.set("tick", 0).unwrap();
    let mut last = root.clone();
    for _ in 0..width {
        let mut current = root.create_child(false);
        for _ in 0..depth {
            current.watch(|s: &Scope| s.get("tick"), |_: &Value, _: &Value, _: &Scope| {});
            current = current.create_child(false);
        }
        last = current;
    }
    root.digest().unwrap();
    (root, last)
}

fn benchmark_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("digest");

    for width in [4, 16, 64] {
        let (root, _) = build_tree(width, 4);
        group.bench_with_input(BenchmarkId::new("clean", width), &width, |b, _| {
            b.iter(|| root.digest().unwrap());
        });

        let (root, _) = build_tree(width, 4);
        let mut tick = 0;
        group.bench_with_input(BenchmarkId::new("root_change", width), &width, |b, _| {
            b.iter(|| {
                tick += 1;
                root.set("tick", black_box(tick)).unwrap();
                root.digest().unwrap();
            });
        });
    }

    group.finish();
}

fn benchmark_broadcast(c: &mut Criterion) {
    let mut group = c.benchmark_group("broadcast");

    for width in [4, 16, 64] {
        let (root, leaf) = build_tree(width, 4);
        leaf.on("ping", |_: &mut Event, _: &[Value]| {});
        group.bench_with_input(BenchmarkId::new("single_listener", width), &width, |b, _| {
            b.iter(|| root.broadcast(black_box("ping"), &[]));
        });

        group.bench_with_input(BenchmarkId::new("no_listener", width), &width, |b, _| {
            b.iter(|| root.broadcast(black_box("pong"), &[]));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_digest, benchmark_broadcast);
criterion_main!(benches);
