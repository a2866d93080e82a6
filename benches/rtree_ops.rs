//! Micro-benchmarks for R-tree operations

use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rand::{rngs::StdRng, Rng, SeedableRng};
use zerodb_rtree::{Mbr, QueryMode, RTree, TransactionId, TreeBuilder};

const TXN: TransactionId = TransactionId(1);

fn random_boxes(n: usize, seed: u64) -> Vec<Mbr> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| {
            let x: f64 = rng.gen_range(0.0..10_000.0);
            let y: f64 = rng.gen_range(0.0..10_000.0);
            let w: f64 = rng.gen_range(0.0..20.0);
            let h: f64 = rng.gen_range(0.0..20.0);
            Mbr::rect(x, y, x + w, y + h)
        })
        .collect()
}

fn build(page_size: usize, boxes: &[Mbr]) -> RTree {
    let tree = TreeBuilder::new().page_size(page_size).in_memory().unwrap();
    for (i, mbr) in boxes.iter().enumerate() {
        tree.insert(TXN, *mbr, (i as u64).to_be_bytes()).unwrap();
    }
    tree
}

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("rtree_insert");
    let boxes = random_boxes(5_000, 1);

    for page_size in [1024, 4096, 16384] {
        group.bench_with_input(BenchmarkId::from_parameter(page_size), &page_size, |b, &page_size| {
            b.iter_batched(
                || TreeBuilder::new().page_size(page_size).in_memory().unwrap(),
                |tree| {
                    for (i, mbr) in boxes.iter().enumerate() {
                        tree.insert(TXN, *mbr, (i as u64).to_be_bytes()).unwrap();
                    }
                    tree
                },
                BatchSize::LargeInput,
            );
        });
    }
    group.finish();
}

fn bench_search(c: &mut Criterion) {
    let mut group = c.benchmark_group("rtree_search");
    let tree = build(4096, &random_boxes(50_000, 2));
    let queries = random_boxes(256, 3)
        .into_iter()
        .map(|q| Mbr::rect(q.min[0], q.min[1], q.min[0] + 200.0, q.min[1] + 200.0))
        .collect::<Vec<_>>();

    for mode in [QueryMode::Intersects, QueryMode::Within, QueryMode::Contains] {
        group.bench_function(format!("{mode:?}"), |b| {
            let mut at = 0;
            b.iter(|| {
                at = (at + 1) % queries.len();
                black_box(tree.search(mode, &queries[at]).unwrap().len())
            });
        });
    }
    group.finish();
}

fn bench_delete(c: &mut Criterion) {
    let boxes = random_boxes(2_000, 4);
    c.bench_function("rtree_delete_all", |b| {
        b.iter_batched(
            || build(1024, &boxes),
            |tree| {
                for (i, mbr) in boxes.iter().enumerate() {
                    tree.delete(TXN, mbr, &(i as u64).to_be_bytes()).unwrap();
                }
                tree
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_estimate(c: &mut Criterion) {
    let tree = build(4096, &random_boxes(20_000, 5));
    let query = Mbr::rect(1000.0, 1000.0, 3000.0, 3000.0);
    c.bench_function("rtree_estimate_rows", |b| {
        b.iter(|| black_box(tree.estimate_rows(QueryMode::Intersects, &query).unwrap()))
    });
}

criterion_group!(benches, bench_insert, bench_search, bench_delete, bench_estimate);
criterion_main!(benches);
