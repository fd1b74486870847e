use criterion::{black_box, criterion_group, criterion_main, Criterion};
use klipper_proto::commands::{encode_queue_step, CommandQueueStep};
use klipper_proto::frame::{build_frame, parse};

fn benchmark_parse(c: &mut Criterion) {
    let step = CommandQueueStep {
        oid: 4,
        interval: 10_000,
        count: 1,
        add: 0,
    };
    let mut payload = Vec::new();
    encode_queue_step(0x10, step, &mut payload);
    let frame = build_frame(1, &payload).unwrap();

    c.bench_function("parse_queue_step_frame", |b| {
        b.iter(|| {
            let _ = parse(black_box(&frame));
        })
    });
}

fn benchmark_build(c: &mut Criterion) {
    let step = CommandQueueStep {
        oid: 4,
        interval: 10_000,
        count: 1,
        add: 0,
    };
    let mut payload = Vec::new();
    encode_queue_step(0x10, step, &mut payload);

    c.bench_function("build_queue_step_frame", |b| {
        b.iter(|| {
            let _ = build_frame(black_box(1), black_box(&payload));
        })
    });
}

criterion_group!(benches, benchmark_parse, benchmark_build);
criterion_main!(benches);
