use criterion::{black_box, criterion_group, criterion_main, Criterion};
use granite::btree::BTreeIndex;
use granite::hash::HashIndex;
use granite::Index;
use tempfile::tempdir;

fn btree_point_ops(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let index = BTreeIndex::open(dir.path().join("bench_btree")).unwrap();
    for key in 0..10_000 {
        index.insert(key, key).unwrap();
    }

    let mut key = 0i64;
    c.bench_function("btree_find", |b| {
        b.iter(|| {
            key = (key + 7919) % 10_000;
            black_box(index.find(key).unwrap());
        })
    });

    let mut next = 10_000i64;
    c.bench_function("btree_insert", |b| {
        b.iter(|| {
            index.insert(next, next).unwrap();
            next += 1;
        })
    });
}

fn hash_point_ops(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let index = HashIndex::open(dir.path().join("bench_hash")).unwrap();
    for key in 0..10_000 {
        index.insert(key, key).unwrap();
    }

    let mut key = 0i64;
    c.bench_function("hash_find", |b| {
        b.iter(|| {
            key = (key + 7919) % 10_000;
            black_box(index.find(key).unwrap());
        })
    });
}

criterion_group!(benches, btree_point_ops, hash_point_ops);
criterion_main!(benches);
