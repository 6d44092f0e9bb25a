//! Allocation and collection throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use veld_gc::{alloc, collect, Collection, Thread, TypeDescriptor, TypeLayout};

static LEAF: TypeDescriptor = TypeDescriptor {
    name: "BenchLeaf",
    size: 16,
    layout: TypeLayout::Opaque,
};

static NODE: TypeDescriptor = TypeDescriptor {
    name: "BenchNode",
    size: 24,
    layout: TypeLayout::Ptr8(&[0]),
};

fn pool_alloc_throughput(c: &mut Criterion) {
    let th = Thread::current();
    let mut group = c.benchmark_group("pool_alloc");
    group.throughput(Throughput::Elements(1));
    group.bench_function("leaf_16b", |b| {
        b.iter(|| {
            let p = alloc(&th, LEAF.size, &LEAF).unwrap();
            black_box(p);
        });
    });
    group.finish();
    // Reclaim the garbage the benchmark produced.
    collect(&th, Collection::Full);
}

fn quick_collect_churn(c: &mut Criterion) {
    let th = Thread::current();
    c.bench_function("quick_collect_64k_garbage", |b| {
        b.iter(|| {
            for _ in 0..4096 {
                let p = alloc(&th, LEAF.size, &LEAF).unwrap();
                black_box(p);
            }
            collect(&th, Collection::Auto);
        });
    });
}

fn mark_chain(c: &mut Criterion) {
    let th = Thread::current();
    // A rooted 10k-node chain dominates the mark phase.
    let mut head = std::ptr::null_mut::<u8>();
    for _ in 0..10_000 {
        let p = alloc(&th, NODE.size, &NODE).unwrap().as_ptr();
        unsafe {
            p.cast::<*mut u8>().write(head);
            p.cast::<usize>().add(1).write(0);
            p.cast::<usize>().add(2).write(0);
        }
        head = p;
    }
    veld_gc::add_global_root(head);
    c.bench_function("mark_10k_chain", |b| {
        b.iter(|| collect(&th, Collection::Auto));
    });
    veld_gc::delete_global_root(head);
}

criterion_group!(benches, pool_alloc_throughput, quick_collect_churn, mark_chain);
criterion_main!(benches);
