//! Planner and preparer hot-path benchmarks.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use photon_common::settings::Settings;
use photon_motion::planner::{NoExec, PlanLineData, Planner};
use photon_motion::segment::{Preparer, segment_ring};

/// Look-ahead cost of inserting into a buffer that keeps draining.
fn bench_buffer_line(c: &mut Criterion) {
    let settings = Settings::default();
    c.bench_function("plan_buffer_line_zigzag", |b| {
        let pl = PlanLineData {
            feed_rate: 4000.0,
            ..PlanLineData::default()
        };
        b.iter_batched(
            || Planner::new(&settings),
            |mut planner| {
                for i in 0..10 {
                    let y = if i % 2 == 0 { 0.0 } else { 10.0 };
                    planner.buffer_line(&[i as f32 * 10.0, y, 0.0], &pl, &mut NoExec);
                }
                black_box(planner.block_count())
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

/// Segment synthesis throughput for one long block.
fn bench_top_up(c: &mut Criterion) {
    let settings = Settings::default();
    c.bench_function("segment_top_up", |b| {
        let pl = PlanLineData {
            feed_rate: 6000.0,
            ..PlanLineData::default()
        };
        b.iter_batched(
            || {
                let mut planner = Planner::new(&settings);
                planner.buffer_line(&[200.0, 0.0, 0.0], &pl, &mut NoExec);
                let prep = Preparer::new(&settings);
                let (producer, consumer) = segment_ring();
                (planner, prep, producer, consumer)
            },
            |(mut planner, mut prep, mut producer, mut consumer)| {
                loop {
                    if !prep.top_up(&mut planner, &mut producer) {
                        break;
                    }
                    while let Some(_segment) = consumer.peek() {
                        consumer.advance();
                    }
                }
                black_box(prep.stats.segments_emitted)
            },
            criterion::BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_buffer_line, bench_top_up);
criterion_main!(benches);
