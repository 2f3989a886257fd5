use cohort::{
    Allocator, AllocatorConfig, FileSequenceStore, MemorySequenceStore, ParticipantId,
    RetryPolicy, Site, StimulusList,
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use std::{hint::black_box, sync::Arc, thread::scope};

fn bench_allocate_memory(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate/memory");
    group.throughput(Throughput::Elements(1));

    let allocator = Allocator::new(MemorySequenceStore::new(), AllocatorConfig::default());
    let site = Site::new("bench").unwrap();
    group.bench_function("single_site", |b| {
        b.iter(|| black_box(allocator.allocate(&site).unwrap()));
    });

    group.bench_function("allocate_release", |b| {
        b.iter(|| {
            let assigned = allocator.allocate(&site).unwrap();
            allocator.release(&site, assigned).unwrap();
        });
    });
    group.finish();
}

fn bench_allocate_contended(c: &mut Criterion) {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 256;

    let mut group = c.benchmark_group("allocate/contended");
    group.throughput(Throughput::Elements((THREADS * PER_THREAD) as u64));

    for sites in [1, THREADS] {
        group.bench_function(format!("{THREADS}_threads_{sites}_sites"), |b| {
            b.iter(|| {
                let allocator = Arc::new(Allocator::new(
                    MemorySequenceStore::new(),
                    AllocatorConfig::default(),
                ));
                scope(|s| {
                    for t in 0..THREADS {
                        let allocator = Arc::clone(&allocator);
                        s.spawn(move || {
                            let site = Site::new(format!("site{}", t % sites)).unwrap();
                            for _ in 0..PER_THREAD {
                                black_box(allocator.allocate(&site).unwrap());
                            }
                        });
                    }
                });
            });
        });
    }
    group.finish();
}

fn bench_allocate_file(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("cohort-bench-{}", std::process::id()));
    let store = FileSequenceStore::open(&dir, RetryPolicy::once()).unwrap();
    let allocator = Allocator::new(store, AllocatorConfig::default());
    let site = Site::new("bench").unwrap();

    c.bench_function("allocate/file", |b| {
        b.iter(|| black_box(allocator.allocate(&site).unwrap()));
    });
    let _ = std::fs::remove_dir_all(dir);
}

fn bench_slice(c: &mut Criterion) {
    let list = StimulusList::new((0..100_000_u32).collect::<Vec<_>>());
    let id = ParticipantId::new(4_321).unwrap();
    c.bench_function("slice", |b| {
        b.iter(|| black_box(list.slice_for(black_box(id), 20).unwrap()));
    });
}

criterion_group!(
    benches,
    bench_allocate_memory,
    bench_allocate_contended,
    bench_allocate_file,
    bench_slice
);
criterion_main!(benches);
