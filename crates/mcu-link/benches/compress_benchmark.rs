use criterion::{black_box, criterion_group, criterion_main, Criterion};
use mcu_link::stepcompress::StepCompressor;

fn benchmark_linear_run(c: &mut Criterion) {
    c.bench_function("compress_linear_run_1000_steps", |b| {
        b.iter(|| {
            let mut compressor = StepCompressor::new(0, 0x10, 25);
            compressor.reset(0);
            compressor.push_factor(black_box(1000), 0.0, 0.0, 100.0);
            black_box(compressor.flush(u64::MAX));
        })
    });
}

fn benchmark_accelerating_run(c: &mut Criterion) {
    c.bench_function("compress_sqrt_run_1000_steps", |b| {
        b.iter(|| {
            let mut compressor = StepCompressor::new(0, 0x10, 25);
            compressor.reset(0);
            compressor.push_sqrt(black_box(1000), 0.0, 0.0, 1.0, 5_000.0);
            black_box(compressor.flush(u64::MAX));
        })
    });
}

criterion_group!(benches, benchmark_linear_run, benchmark_accelerating_run);
criterion_main!(benches);
