//! End-to-end pipeline tests: text line → parser → planner → segments
//! → pulse bytes → machine position.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use photon_common::settings::Settings;
use photon_common::state::{SystemSignals, state_machine};
use photon_motion::gcode::{ParserState, execute_line};
use photon_motion::line::groom_line;
use photon_motion::motion_ctrl::MotionCtrl;
use photon_motion::segment::segment_ring;
use photon_motion::stepgen::{Tick, Tracer};

fn build() -> (MotionCtrl, Tracer, Arc<SystemSignals>) {
    let (_aggregator, port) = state_machine();
    let signals = Arc::clone(port.signals());
    let (stepgen_tx, _stepgen_rx) = crossbeam_channel::bounded(8);
    let (producer, consumer) = segment_ring();
    let mc = MotionCtrl::new(Settings::default(), port, stepgen_tx, producer);
    (mc, Tracer::new(consumer), signals)
}

/// Alternate between preparer top-ups and tracer ticks until both run
/// dry, returning the number of pulse bytes emitted.
fn run_to_completion(mc: &mut MotionCtrl, tracer: &mut Tracer, signals: &SystemSignals) -> u64 {
    let mut bytes = 0u64;
    loop {
        let produced = mc.top_up();
        let mut ticked = false;
        loop {
            match tracer.tick(signals) {
                Tick::Pulse(_) => {
                    bytes += 1;
                    ticked = true;
                }
                Tick::Idle | Tick::HoldPoint => break,
            }
        }
        if !produced && !ticked {
            return bytes;
        }
    }
}

#[test]
fn linear_g0_executes_to_exact_position() {
    let (mut mc, mut tracer, signals) = build();
    let mut parser = ParserState::new();

    let line = groom_line("G0 X100 Y0 F0").unwrap();
    execute_line(&mut parser, &line, &mut mc, false).unwrap();

    run_to_completion(&mut mc, &mut tracer, &signals);

    // 100 mm at 106.666 steps/mm.
    assert_eq!(signals.position(), [10667, 0, 0]);

    // Reported machine position lands within ±0.01 mm.
    let spmm = mc.settings.axes[0].steps_per_mm;
    let mpos = signals.position()[0] as f32 / spmm;
    assert!((mpos - 100.0).abs() < 0.01, "MPos {mpos}");
}

#[test]
fn negative_moves_count_down() {
    let (mut mc, mut tracer, signals) = build();
    let mut parser = ParserState::new();

    for text in ["G1 X-10 Y5 F2000", "G1 X-20 Y-3"] {
        let line = groom_line(text).unwrap();
        execute_line(&mut parser, &line, &mut mc, false).unwrap();
    }
    run_to_completion(&mut mc, &mut tracer, &signals);

    let settings = &mc.settings;
    let expected_x = (-20.0 * settings.axes[0].steps_per_mm).round() as i32;
    let expected_y = (-3.0 * settings.axes[1].steps_per_mm).round() as i32;
    assert_eq!(signals.position(), [expected_x, expected_y, 0]);
}

#[test]
fn multi_line_path_preserves_step_budget() {
    // Step-count invariance across a whole program: the final machine
    // position equals the rounded-step image of the final target.
    let (mut mc, mut tracer, signals) = build();
    let mut parser = ParserState::new();

    let program = [
        "G1 X20 F4000",
        "G1 X20 Y20",
        "G1 X0 Y20",
        "G1 X0 Y0",
        "G1 X7.5 Y2.5 Z1",
    ];
    for text in program {
        let line = groom_line(text).unwrap();
        execute_line(&mut parser, &line, &mut mc, false).unwrap();
    }
    run_to_completion(&mut mc, &mut tracer, &signals);

    let settings = &mc.settings;
    let expected = [
        (7.5 * settings.axes[0].steps_per_mm).round() as i32,
        (2.5 * settings.axes[1].steps_per_mm).round() as i32,
        (1.0 * settings.axes[2].steps_per_mm).round() as i32,
    ];
    assert_eq!(signals.position(), expected);
    assert_eq!(mc.planner.stats.blocks_queued, 5);
}

#[test]
fn full_circle_arc_subdivides_and_returns_home() {
    // Full IJK circle. The planner ring is much smaller than the chord
    // count, so a concurrent consumer drains segments while the parser
    // worker blocks on ring space, exactly like the real pipeline.
    let (mut mc, tracer, signals) = build();
    let mut parser = ParserState::new();

    let done = Arc::new(AtomicBool::new(false));
    let drain_done = Arc::clone(&done);
    let drain_signals = Arc::clone(&signals);
    let mut drain_tracer = tracer;
    let drain = std::thread::spawn(move || {
        loop {
            match drain_tracer.tick(&drain_signals) {
                Tick::Pulse(_) => {}
                Tick::Idle | Tick::HoldPoint => {
                    if drain_done.load(Ordering::Acquire) {
                        return drain_tracer.stats;
                    }
                    std::thread::sleep(std::time::Duration::from_micros(200));
                }
            }
        }
    });

    // Move to the arc start, then cut a full circle of radius 5.
    let start = groom_line("G0 X5 Y0").unwrap();
    execute_line(&mut parser, &start, &mut mc, false).unwrap();
    let circle = groom_line("G2 X5 Y0 I-5 J0 F3000").unwrap();
    execute_line(&mut parser, &circle, &mut mc, false).unwrap();

    // Drain the remaining blocks.
    while !mc.planner.is_empty() || mc.prep.is_active() {
        mc.top_up();
        std::thread::sleep(std::time::Duration::from_millis(1));
    }
    done.store(true, Ordering::Release);
    let stats = drain.join().unwrap();

    let expected_chords =
        photon_motion::motion_ctrl::arc_segment_count(5.0, 2.0 * std::f32::consts::PI, 0.002)
            as u64;
    assert!(expected_chords > 50);
    // Start move + every chord of the circle.
    assert_eq!(mc.planner.stats.blocks_queued, 1 + expected_chords);

    // Queued path length: 5 mm lead-in plus the circumference, within
    // one percent.
    let circumference = 2.0 * std::f64::consts::PI * 5.0;
    let queued = mc.planner.stats.millimeters_queued;
    assert!(
        (queued - 5.0 - circumference).abs() / circumference < 0.01,
        "queued {queued}"
    );

    // The circle closes: back at the start position.
    let spmm = mc.settings.axes[0].steps_per_mm;
    assert_eq!(
        signals.position(),
        [(5.0 * spmm).round() as i32, 0, 0]
    );
    assert!(stats.steps_fired > 0);
}

#[test]
fn parser_errors_queue_nothing() {
    let (mut mc, mut tracer, signals) = build();
    let mut parser = ParserState::new();

    let line = groom_line("G0 G1 X1").unwrap();
    assert!(execute_line(&mut parser, &line, &mut mc, false).is_err());

    let bytes = run_to_completion(&mut mc, &mut tracer, &signals);
    assert_eq!(bytes, 0);
    assert_eq!(signals.position(), [0, 0, 0]);
}
