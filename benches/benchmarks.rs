// benches/benchmarks.rs -- CPU reference, token pool and host-queue benchmarks.
//
//   cargo bench --bench benchmarks
//
// The host backend runs the reference kernels, so these numbers measure
// scheduling overhead on top of the CPU math, not device speed. The
// interesting comparison is batched vs pipelined at the same input count,
// and how the barrier interval moves the pipelined cost.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use wavefront::host::HostDevice;
use wavefront::scheduler::{run_batched, run_pipelined};
use wavefront::token_pool::{DependencyTokenPool, WorkItem};
use wavefront::{NetworkConfig, Pipeline};

// ============================================================
// Helpers
// ============================================================

fn make_inputs(n: usize) -> Vec<f32> {
    (0..n * 1024).map(|i| ((i * 37) % 255) as f32 / 255.0).collect()
}

// ============================================================
// Benchmarks
// ============================================================

fn bench_token_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("token_pool");
    for stages in [2usize, 7, 16] {
        group.bench_with_input(BenchmarkId::new("resolve_push_1000", stages), &stages, |b, &s| {
            b.iter(|| {
                let mut pool = DependencyTokenPool::new(s);
                let mut next = 0u64;
                for n in 0..1000 {
                    for stage in 0..s {
                        let item = WorkItem::new(stage, n);
                        let deps = pool.resolve(item).unwrap();
                        black_box(deps);
                        pool.push(item, next).unwrap();
                        next += 1;
                    }
                }
                pool
            });
        });
    }
    group.finish();
}

fn bench_lenet_cpu(c: &mut Criterion) {
    let mut dev = HostDevice::in_order();
    let pipeline = Pipeline::from_config(&mut dev, &NetworkConfig::lenet5(1)).unwrap();
    let input = make_inputs(1);

    let mut group = c.benchmark_group("lenet5_cpu");
    group.bench_function("forward_single", |b| {
        b.iter(|| pipeline.forward_cpu(black_box(&input)));
    });
    group.finish();
}

fn bench_host_scheduler(c: &mut Criterion) {
    let config = NetworkConfig::lenet5(1);
    let n = 64;
    let inputs = make_inputs(n);

    let mut group = c.benchmark_group("host_scheduler");
    group.sample_size(20);

    let mut dev = HostDevice::in_order();
    let mut pipeline = Pipeline::from_config(&mut dev, &config).unwrap();
    group.bench_function("batched_in_order_64", |b| {
        b.iter(|| run_batched(&mut dev, &mut pipeline, &inputs, n).unwrap());
    });

    for barrier in [1usize, 8, 64] {
        let mut dev = HostDevice::out_of_order(7);
        let mut pipeline = Pipeline::from_config(&mut dev, &config).unwrap();
        group.bench_with_input(
            BenchmarkId::new("pipelined_out_of_order_64", barrier),
            &barrier,
            |b, &barrier| {
                b.iter(|| run_pipelined(&mut dev, &mut pipeline, &inputs, n, barrier).unwrap());
            },
        );
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_token_pool,
    bench_lenet_cpu,
    bench_host_scheduler,
);
criterion_main!(benches);
