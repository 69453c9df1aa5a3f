//! Allocation Hot-Path Benchmarks

use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_malloc_free(c: &mut Criterion) {
    zonal::init().unwrap();
    zonal::attach_current_thread();

    let mut group = c.benchmark_group("malloc_free");
    for size in [16usize, 64, 256, 4096, 65536] {
        group.bench_function(format!("{size}B"), |bencher| {
            bencher.iter(|| {
                let ptr = zonal::malloc(black_box(size));
                unsafe { zonal::free(ptr) };
            });
        });
    }
    group.finish();
}

fn bench_batched_lifetimes(c: &mut Criterion) {
    zonal::init().unwrap();
    zonal::attach_current_thread();

    // Closer to real workloads: many live objects, freed out of order.
    c.bench_function("batch_64x48B", |bencher| {
        bencher.iter(|| {
            let ptrs: Vec<*mut u8> = (0..64).map(|_| zonal::malloc(black_box(48))).collect();
            for ptr in ptrs.into_iter().rev() {
                unsafe { zonal::free(ptr) };
            }
        });
    });
}

fn bench_introspection(c: &mut Criterion) {
    zonal::init().unwrap();
    zonal::attach_current_thread();

    let ptr = zonal::malloc(1000);
    c.bench_function("get_address_infos", |bencher| {
        bencher.iter(|| zonal::get_address_infos(black_box(ptr)));
    });
    unsafe { zonal::free(ptr) };
}

criterion_group!(
    benches,
    bench_malloc_free,
    bench_batched_lifetimes,
    bench_introspection
);
criterion_main!(benches);
