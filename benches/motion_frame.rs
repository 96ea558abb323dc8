use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use vtbus::motion::{MotionConfig, MotionCore};

const DX: usize = 320;
const DY: usize = 240;

fn checkerboard(seed: u8) -> Vec<u8> {
    (0..DX * DY).map(|i| if (i as u8).wrapping_add(seed) % 2 == 0 { 10 } else { 200 }).collect()
}

fn bench_motion_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("motion");

    group.bench_function("process_changed_frame", |b| {
        b.iter_batched(
            || (MotionCore::new(MotionConfig::default()), checkerboard(0), checkerboard(1)),
            |(mut core, first, second)| {
                core.process(&first, DX, DY, 0).expect("first frame");
                let outcome = core.process(&second, DX, DY, 1).expect("second frame");
                black_box(outcome.count);
            },
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_motion_frame);
criterion_main!(benches);
