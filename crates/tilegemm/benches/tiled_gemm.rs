use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tilegemm::scheduler::BaseOffsets;
use tilegemm::{
    DeviceExt, GemmConfig, GemmContext, GemmGeometry, GemmRequest, ReferenceDevice, TilePlan,
    Transpose, gemm,
};

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("tile_plan");
    for size in [256usize, 1024, 4096] {
        let geometry = GemmGeometry::new(Transpose::NoTrans, Transpose::Trans, size, size, size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &geometry, |b, geometry| {
            b.iter(|| {
                let plan = TilePlan::new(*geometry, 64, BaseOffsets::default()).unwrap();
                black_box(plan.steps().map(|s| s.c_offset).sum::<usize>())
            });
        });
    }
    group.finish();
}

fn bench_reference_gemm(c: &mut Criterion) {
    let mut group = c.benchmark_group("reference_gemm");
    group.sample_size(10);
    for (size, edge) in [(64usize, 32usize), (96, 32), (128, 64)] {
        let device = Arc::new(ReferenceDevice::new());
        let config = GemmConfig {
            max_tile_edge: edge,
            ..GemmConfig::default()
        };
        let ctx = GemmContext::new(device.clone(), config).unwrap();
        let a = device.upload(&vec![0.5f32; size * size]).unwrap();
        let b = device.upload(&vec![0.25f32; size * size]).unwrap();
        let out = device.upload(&vec![0.0f32; size * size]).unwrap();

        group.throughput(Throughput::Elements((2 * size * size * size) as u64));
        group.bench_function(BenchmarkId::new(format!("edge{edge}"), size), |bench| {
            bench.iter(|| {
                let request = GemmRequest::<f32>::new(size, size, size, &a, &b, &out);
                let outcome = gemm(&ctx, &request).unwrap();
                ctx.quiesce().unwrap();
                black_box(outcome)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_plan, bench_reference_gemm);
criterion_main!(benches);
