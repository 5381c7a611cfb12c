//! Subject trie benchmarks: lookups against large subscription sets.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use strata_broker::{network::Connection, Subscription, SubscriptionIndex};

const SIZES: [usize; 3] = [100, 10_000, 100_000];

/// `n` subscriptions spread over literal, `*` and `>` patterns.
fn populated(n: usize, queue: Option<&str>) -> SubscriptionIndex {
    let index = SubscriptionIndex::new();
    let (client, _rx) = Connection::detached(1);
    for i in 0..n {
        let subject = match i % 4 {
            0 => format!("orders.{}.created", i % 1000),
            1 => format!("orders.*.{}", i % 100),
            2 => format!("metrics.{}.>", i % 500),
            _ => format!("audit.{i}"),
        };
        let sub = Subscription::new(Arc::clone(&client), i.to_string(), subject, queue.map(String::from));
        index.insert(Arc::new(sub));
    }
    index
}

fn bench_literal_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("matching");
    for size in SIZES {
        let index = populated(size, None);
        group.bench_with_input(BenchmarkId::from_parameter(size), &index, |b, index| {
            b.iter(|| black_box(index.matching(black_box("orders.42.created")).len()));
        });
    }
    group.finish();
}

fn bench_deep_wildcard_lookup(c: &mut Criterion) {
    let index = populated(10_000, None);
    c.bench_function("matching_full_wildcard_10k", |b| {
        b.iter(|| black_box(index.matching(black_box("metrics.7.cpu.load.avg")).len()));
    });
}

fn bench_queue_group_select(c: &mut Criterion) {
    let index = populated(10_000, Some("workers"));
    c.bench_function("select_queue_group_10k", |b| {
        b.iter(|| black_box(index.select(black_box("orders.42.created")).len()));
    });
}

criterion_group!(benches, bench_literal_lookup, bench_deep_wildcard_lookup, bench_queue_group_select);
criterion_main!(benches);
