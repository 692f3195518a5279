use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

use condup::bst::BstMap;
use condup::btree::BtreeMap;
use condup::rbtree::RbTreeMap;

const N: u64 = 4096;

// A fixed odd stride walks the whole residue ring, giving a scrambled
// but deterministic key order without pulling a generator into the
// measured loop.
fn scrambled(i: u64) -> u64 {
    (i * 2654435761) % N
}

fn insert_fill(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_fill");
    group.throughput(Throughput::Elements(N));
    group.bench_function("bst", |b| {
        b.iter(|| {
            let map: BstMap<u64, u64> = BstMap::new();
            for i in 0..N {
                map.insert(scrambled(i), i);
            }
            map
        })
    });
    group.bench_function("rbtree", |b| {
        b.iter(|| {
            let map: RbTreeMap<u64, u64> = RbTreeMap::new();
            for i in 0..N {
                map.insert(scrambled(i), i);
            }
            map
        })
    });
    group.bench_function("btree", |b| {
        b.iter(|| {
            let map: BtreeMap<u64, u64> = BtreeMap::new();
            for i in 0..N {
                map.insert(scrambled(i), i);
            }
            map
        })
    });
    group.finish();
}

fn get_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_hit");
    group.throughput(Throughput::Elements(N));

    let bst: BstMap<u64, u64> = (0..N).map(|i| (scrambled(i), i)).collect();
    group.bench_function("bst", |b| {
        b.iter(|| {
            for k in 0..N {
                criterion::black_box(bst.get(&k));
            }
        })
    });

    let rb: RbTreeMap<u64, u64> = (0..N).map(|i| (scrambled(i), i)).collect();
    group.bench_function("rbtree", |b| {
        b.iter(|| {
            for k in 0..N {
                criterion::black_box(rb.get(&k));
            }
        })
    });

    let bt: BtreeMap<u64, u64> = (0..N).map(|i| (scrambled(i), i)).collect();
    group.bench_function("btree", |b| {
        b.iter(|| {
            for k in 0..N {
                criterion::black_box(bt.get(&k));
            }
        })
    });
    group.finish();
}

fn remove_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("remove_drain");
    group.throughput(Throughput::Elements(N));
    group.bench_function("rbtree", |b| {
        b.iter_batched(
            || (0..N).map(|i| (scrambled(i), i)).collect::<RbTreeMap<u64, u64>>(),
            |map| {
                for k in 0..N {
                    map.remove(&k);
                }
                map
            },
            BatchSize::LargeInput,
        )
    });
    group.bench_function("btree", |b| {
        b.iter_batched(
            || (0..N).map(|i| (scrambled(i), i)).collect::<BtreeMap<u64, u64>>(),
            |map| {
                for k in 0..N {
                    map.remove(&k);
                }
                map
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, insert_fill, get_hit, remove_drain);
criterion_main!(benches);
